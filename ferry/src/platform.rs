use std::mem::size_of;

/// Data model of the foreign side: widths of `void*` and C `long`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub pointer_size: u64,
    pub long_size: u64,
}

impl Platform {
    /// Linux, macOS and most 64-bit unices.
    pub const LP64: Platform = Platform {
        pointer_size: 8,
        long_size: 8,
    };
    /// 64-bit Windows.
    pub const LLP64: Platform = Platform {
        pointer_size: 8,
        long_size: 4,
    };
    pub const ILP32: Platform = Platform {
        pointer_size: 4,
        long_size: 4,
    };

    pub fn host() -> Platform {
        Platform {
            pointer_size: size_of::<usize>() as u64,
            long_size: size_of::<libc::c_long>() as u64,
        }
    }

    pub fn is_host(&self) -> bool {
        *self == Platform::host()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::host()
    }
}
