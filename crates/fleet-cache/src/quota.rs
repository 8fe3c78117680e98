use crate::artifact::QUOTA_MARKER_FILENAME;
use crate::util::BYTES_PER_GB;
use std::path::Path;

/// Quotas below this are raised to it.
pub const MIN_QUOTA_GB: u64 = 10;

/// Which eviction policy governs a cache root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// `MaxDirSize.txt` is present: keep the directory under `max_size_gb`.
    TotalSize { max_size_gb: u64 },
    /// No marker: keep `threshold_percent` of the volume free.
    FreeSpace {
        threshold_percent: u8,
        required_free_mb: u64,
    },
}

impl QuotaPolicy {
    /// Select the policy for `root` from the presence of `MaxDirSize.txt`.
    ///
    /// A marker that exists but cannot be parsed is logged and ignored.
    pub fn for_root(root: &Path, threshold_percent: u8, required_free_mb: u64) -> Self {
        match read_quota_marker(root) {
            Ok(Some(max_size_gb)) => Self::TotalSize { max_size_gb },
            Ok(None) => Self::free_space(threshold_percent, required_free_mb),
            Err(err) => {
                tracing::error!(
                    target: "fleet.cache",
                    root = %root.display(),
                    error = %err,
                    "ignoring malformed {QUOTA_MARKER_FILENAME}; using free-space policy"
                );
                Self::free_space(threshold_percent, required_free_mb)
            }
        }
    }

    fn free_space(threshold_percent: u8, required_free_mb: u64) -> Self {
        Self::FreeSpace {
            threshold_percent: crate::config::clamp_threshold_percent(threshold_percent),
            required_free_mb,
        }
    }
}

/// Quota in bytes for a `MaxSizeGB` value, after clamping to [`MIN_QUOTA_GB`].
pub fn quota_bytes(max_size_gb: u64) -> u64 {
    max_size_gb.max(MIN_QUOTA_GB).saturating_mul(BYTES_PER_GB)
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaMarkerError {
    #[error("failed to read quota marker: {0}")]
    Io(#[from] std::io::Error),
    #[error("quota marker has no MaxSizeGB=<int> line")]
    MissingSetting,
    #[error("quota marker has non-numeric MaxSizeGB value {value:?}")]
    InvalidValue { value: String },
}

/// Read `<root>/MaxDirSize.txt`; `Ok(None)` when the marker does not exist.
pub fn read_quota_marker(root: &Path) -> Result<Option<u64>, QuotaMarkerError> {
    let path = root.join(QUOTA_MARKER_FILENAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    parse_quota_marker(&text).map(Some)
}

pub fn parse_quota_marker(text: &str) -> Result<u64, QuotaMarkerError> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("MaxSizeGB") {
            continue;
        }
        let value = value.trim();
        return value
            .parse::<u64>()
            .map_err(|_| QuotaMarkerError::InvalidValue {
                value: value.to_string(),
            });
    }
    Err(QuotaMarkerError::MissingSetting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_setting_among_comments() {
        let text = "# Maximum size for this share\n\nMaxSizeGB=50\n";
        assert_eq!(parse_quota_marker(text).unwrap(), 50);
        assert_eq!(parse_quota_marker("  maxsizegb = 75 ").unwrap(), 75);
    }

    #[test]
    fn commented_out_setting_is_missing() {
        let err = parse_quota_marker("#MaxSizeGB=50\n").unwrap_err();
        assert!(matches!(err, QuotaMarkerError::MissingSetting));
    }

    #[test]
    fn non_numeric_setting_is_invalid() {
        let err = parse_quota_marker("MaxSizeGB=lots\n").unwrap_err();
        assert!(matches!(err, QuotaMarkerError::InvalidValue { .. }));
    }

    #[test]
    fn quota_is_clamped_to_minimum() {
        assert_eq!(quota_bytes(2), 10 * BYTES_PER_GB);
        assert_eq!(quota_bytes(50), 50 * BYTES_PER_GB);
    }

    #[test]
    fn marker_selects_total_size_policy_and_ignores_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(QUOTA_MARKER_FILENAME), "MaxSizeGB=50\n").unwrap();
        assert_eq!(
            QuotaPolicy::for_root(tmp.path(), 30, 500),
            QuotaPolicy::TotalSize { max_size_gb: 50 }
        );
    }

    #[test]
    fn malformed_marker_falls_back_to_free_space() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(QUOTA_MARKER_FILENAME), "MaxSizeGB=\n").unwrap();
        assert_eq!(
            QuotaPolicy::for_root(tmp.path(), 80, 0),
            QuotaPolicy::FreeSpace {
                threshold_percent: 50,
                required_free_mb: 0
            }
        );
    }

    #[test]
    fn missing_marker_selects_free_space() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_quota_marker(tmp.path()).unwrap(), None);
        assert_eq!(
            QuotaPolicy::for_root(tmp.path(), 0, 10),
            QuotaPolicy::FreeSpace {
                threshold_percent: 1,
                required_free_mb: 10
            }
        );
    }

    #[test]
    fn policy_serializes_with_a_tag() {
        let json = serde_json::to_value(QuotaPolicy::TotalSize { max_size_gb: 50 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "policy": "total_size", "max_size_gb": 50 })
        );
    }
}
