//! 版本匹配
//!
//! 判断发现的模块版本是否满足钩子声明的语义化版本范围。
//! 范围表达式采用 npm 语法子集，转换为 `semver::VersionReq` 后求值。

use crate::{InstrumentError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use tracing::warn;

static COERCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,16})(?:\.(\d{1,16}))?(?:\.(\d{1,16}))?").expect("valid regex"));

static HYPHEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+)\s+-\s+(\S+)\s*$").expect("valid regex"));

/// 版本是否满足范围集合
///
/// - 版本未知：匹配
/// - 未声明范围：匹配
/// - 否则：强制转换后满足任意一个范围即匹配
pub fn match_version(version: Option<&str>, ranges: Option<&[String]>) -> bool {
    let Some(raw) = version else {
        return true;
    };
    let Some(ranges) = ranges else {
        return true;
    };

    let Some(version) = coerce(raw) else {
        warn!(version = raw, "Unrecognized module version, assuming compatible");
        return true;
    };

    ranges.iter().any(|range| satisfies(&version, range))
}

/// 把任意版本字符串强制转换为语义化版本
///
/// 取第一个 `major[.minor[.patch]]` 数字序列，缺失部分补 0，
/// 预发布和构建元数据被丢弃。
pub fn coerce(raw: &str) -> Option<Version> {
    let captures = COERCE_RE.captures(raw)?;
    let part = |index: usize| -> Option<u64> {
        match captures.get(index) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

/// 版本是否满足单个范围表达式，无法解析的表达式视为不满足
pub fn satisfies(version: &Version, range: &str) -> bool {
    match parse_range(range) {
        Ok(alternatives) => alternatives.iter().any(|req| req.matches(version)),
        Err(e) => {
            warn!(range, error = %e, "Ignoring unparseable version range");
            false
        }
    }
}

/// 解析 npm 风格的范围表达式
///
/// `||` 分隔的每个分支转换为一个 `VersionReq`，分支内空白分隔的比较器取交集。
pub fn parse_range(range: &str) -> Result<Vec<VersionReq>> {
    range
        .split("||")
        .map(|alternative| {
            let translated = translate_alternative(alternative.trim())?;
            VersionReq::parse(&translated).map_err(|e| {
                InstrumentError::version(&format!("Invalid version range '{}': {}", range, e))
            })
        })
        .collect()
}

fn translate_alternative(alternative: &str) -> Result<String> {
    if alternative.is_empty() || matches!(alternative, "*" | "x" | "X") {
        return Ok("*".to_string());
    }

    if let Some(captures) = HYPHEN_RE.captures(alternative) {
        let low = strip_v(&captures[1]);
        let high = strip_v(&captures[2]);
        return Ok(format!(">={}, <={}", low, high));
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op = Some(token);
            continue;
        }
        let token = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        comparators.push(translate_comparator(&token));
    }

    if let Some(op) = pending_op {
        return Err(InstrumentError::version(&format!(
            "Dangling operator '{}' in range '{}'",
            op, alternative
        )));
    }

    Ok(comparators.join(", "))
}

/// 单个比较器：裸的完整版本表示精确匹配，裸的部分版本表示该前缀下的任意版本
fn translate_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '~' | '^'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = strip_v(version);

    if !op.is_empty() {
        return format!("{}{}", op, version);
    }

    let is_wildcard = version.split('.').any(|p| matches!(p, "*" | "x" | "X"));
    let parts = version.split('.').count();
    if is_wildcard {
        version.to_string()
    } else if parts >= 3 {
        format!("={}", version)
    } else {
        format!("~{}", version)
    }
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}
