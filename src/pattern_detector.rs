//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 攻击特征检测
//!
//! 对 URL 路径、查询参数值和请求体做大小写不敏感的子串匹配。
//! 不使用正则：匹配耗时与输入长度线性相关，没有回溯风险。
//!
//! 同一请求的所有命中合并为一条安全事件，事件类型按特征族优先级决定：
//! SQL 注入 > XSS > 其他（`suspicious_pattern`）。

use crate::records::EventType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 特征族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFamily {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    Generic,
}

impl SignatureFamily {
    /// 分类优先级，越大越优先
    fn rank(&self) -> u8 {
        match self {
            SignatureFamily::SqlInjection => 3,
            SignatureFamily::Xss => 2,
            SignatureFamily::PathTraversal
            | SignatureFamily::CommandInjection
            | SignatureFamily::Generic => 1,
        }
    }

    /// 对应的安全事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            SignatureFamily::SqlInjection => EventType::SqlInjection,
            SignatureFamily::Xss => EventType::XssAttempt,
            _ => EventType::SuspiciousPattern,
        }
    }
}

/// 攻击特征
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub pattern: String,
    pub family: SignatureFamily,
}

impl Signature {
    pub fn new(pattern: &str, family: SignatureFamily) -> Self {
        Self {
            pattern: pattern.to_string(),
            family,
        }
    }
}

/// 默认特征列表
pub fn default_signatures() -> Vec<Signature> {
    use SignatureFamily::*;

    [
        ("union select", SqlInjection),
        ("drop table", SqlInjection),
        ("exec(", CommandInjection),
        ("script>", Xss),
        ("../", PathTraversal),
        ("..\\", PathTraversal),
        ("/etc/passwd", PathTraversal),
        ("cmd.exe", CommandInjection),
        ("<script", Xss),
        ("javascript:", Xss),
        ("onerror=", Xss),
        ("onload=", Xss),
    ]
    .into_iter()
    .map(|(pattern, family)| Signature::new(pattern, family))
    .collect()
}

/// 命中位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FindingLocation {
    /// URL 路径
    Path,
    /// 查询参数（参数名）
    QueryParam(String),
    /// 请求体
    Body,
}

/// 单个命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub location: FindingLocation,
    pub signature: String,
    pub family: SignatureFamily,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            FindingLocation::Path => write!(f, "URL contains '{}'", self.signature),
            FindingLocation::QueryParam(name) => {
                write!(f, "GET param '{}' contains '{}'", name, self.signature)
            }
            FindingLocation::Body => write!(f, "Body contains '{}'", self.signature),
        }
    }
}

/// 一次扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// 按优先级得出的事件类型；无命中时为 `None`
    pub fn event_type(&self) -> Option<EventType> {
        self.findings
            .iter()
            .map(|finding| finding.family)
            .max_by_key(SignatureFamily::rank)
            .map(|family| family.event_type())
    }

    /// 合并后的事件描述
    pub fn description(&self) -> String {
        let joined = self
            .findings
            .iter()
            .map(Finding::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("Suspicious patterns detected: {}", joined)
    }
}

/// 攻击特征检测器
#[derive(Debug, Clone)]
pub struct PatternDetector {
    /// (小写特征, 原始特征)
    signatures: Vec<(String, Signature)>,
}

impl PatternDetector {
    pub fn new(signatures: Vec<Signature>) -> Self {
        let signatures = signatures
            .into_iter()
            .filter(|sig| !sig.pattern.is_empty())
            .map(|sig| (sig.pattern.to_lowercase(), sig))
            .collect();
        Self { signatures }
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// 扫描路径、查询参数值与请求体
    ///
    /// 请求体按 UTF-8 有损解码，空请求体直接跳过。
    pub fn scan(&self, path: &str, query_params: &[(String, String)], body: &[u8]) -> ScanReport {
        let mut report = ScanReport::default();

        self.scan_text(&path.to_lowercase(), FindingLocation::Path, &mut report);

        for (name, value) in query_params {
            self.scan_text(
                &value.to_lowercase(),
                FindingLocation::QueryParam(name.clone()),
                &mut report,
            );
        }

        if !body.is_empty() {
            let text = String::from_utf8_lossy(body).to_lowercase();
            self.scan_text(&text, FindingLocation::Body, &mut report);
        }

        report
    }

    fn scan_text(&self, haystack: &str, location: FindingLocation, report: &mut ScanReport) {
        if haystack.is_empty() {
            return;
        }
        for (needle, signature) in &self.signatures {
            if haystack.contains(needle.as_str()) {
                report.findings.push(Finding {
                    location: location.clone(),
                    signature: signature.pattern.clone(),
                    family: signature.family,
                });
            }
        }
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(default_signatures())
    }
}

// ============================================================================
// 单元测试
// ============================================================================
