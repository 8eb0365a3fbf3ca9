//! 测试模块根目录
//!
//! 按功能模块组织的跨模块测试

mod blacklist_admin;
mod logging;
