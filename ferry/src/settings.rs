use std::path::PathBuf;

use crate::Platform;

#[derive(Debug, Default, Clone)]
pub struct LinkerCreateInfo {
    /// Directories tried before the system loader path.
    pub search_paths: Vec<PathBuf>,
    // bytes per arena chunk, default 4096
    pub arena_chunk_size: Option<usize>,
    // defaults to the host data model
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone)]
pub struct LinkerSettings {
    pub search_paths: Vec<PathBuf>,
    pub arena_chunk_size: usize,
    pub platform: Platform,
}

impl Default for LinkerSettings {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            arena_chunk_size: 4096,
            platform: Platform::host(),
        }
    }
}

impl From<LinkerCreateInfo> for LinkerSettings {
    fn from(info: LinkerCreateInfo) -> Self {
        let mut settings = LinkerSettings {
            search_paths: info.search_paths,
            ..LinkerSettings::default()
        };
        info.arena_chunk_size
            .inspect(|&val| settings.arena_chunk_size = val);
        info.platform.inspect(|&val| settings.platform = val);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_fall_back_to_defaults() {
        let settings = LinkerSettings::from(LinkerCreateInfo {
            arena_chunk_size: Some(512),
            ..Default::default()
        });
        assert_eq!(settings.arena_chunk_size, 512);
        assert_eq!(settings.platform, Platform::host());
        assert!(settings.search_paths.is_empty());
    }
}
