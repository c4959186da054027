//! Path processing utility functions / 路径处理工具函数

/// Clean and normalize path / 清理和规范化路径
/// 1. Replace backslashes with forward slashes / 将反斜杠替换为正斜杠
/// 2. Ensure path starts with / / 确保路径以 / 开头
/// 3. Clean . and .. in path / 清理路径中的 . 和 ..
pub fn fix_and_clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Progress percentage, 100 for an empty total / 进度百分比
pub fn percent(completed: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        completed.saturating_mul(100) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_and_clean_path() {
        assert_eq!(fix_and_clean_path(""), "/");
        assert_eq!(fix_and_clean_path("a\\b//c/"), "/a/b/c");
        assert_eq!(fix_and_clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(fix_and_clean_path("/../../etc"), "/etc");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(25, 100), 25);
        assert_eq!(percent(999, 1000), 99);
    }
}
