use std::fmt;
use std::io;
use std::path::Path;

/// Free and total bytes of the volume holding a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSpace {
    pub fn free_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 * 100.0 / self.total_bytes as f64
    }

    /// Whether this much free space satisfies both the percentage and the absolute target.
    pub fn meets(&self, threshold_percent: u8, required_free_bytes: u64) -> bool {
        self.free_percent() >= f64::from(threshold_percent)
            && (required_free_bytes == 0 || self.free_bytes >= required_free_bytes)
    }

    /// Bytes still missing before [`DiskSpace::meets`] holds.
    pub fn shortfall(&self, threshold_percent: u8, required_free_bytes: u64) -> u64 {
        let by_percent = (self.total_bytes as f64 * f64::from(threshold_percent) / 100.0).ceil();
        let target = (by_percent as u64).max(required_free_bytes);
        target.saturating_sub(self.free_bytes)
    }

    /// Estimated space after `freed` more bytes are released.
    pub fn after_freeing(&self, freed: u64) -> Self {
        Self {
            free_bytes: self.free_bytes.saturating_add(freed).min(self.total_bytes),
            total_bytes: self.total_bytes,
        }
    }
}

/// Query the free space of the volume holding a path.
pub trait VolumeStats: Send + Sync + fmt::Debug {
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace>;
}

/// [`VolumeStats`] backed by the operating system via `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2Volume;

impl VolumeStats for Fs2Volume {
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace> {
        Ok(DiskSpace {
            free_bytes: fs2::available_space(path)?,
            total_bytes: fs2::total_space(path)?,
        })
    }
}
