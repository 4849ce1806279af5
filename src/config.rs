//! Target description and registry configuration.
//!
//! A [`Target`] pins down everything about the machine a descriptor is laid out for: its
//! pointer width and whether build-time records may use 32-bit relative pointers. The
//! derived sizes (fixed prefix, object header, single-dimension array base size) all flow
//! from those two facts.
//!
//! [`RegistryConfig`] bundles the target with the knobs of a [`crate::TypeRegistry`].

/// The machine a descriptor is laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    /// Native pointer width in bytes (4 or 8)
    pub pointer_size: u32,
    /// Whether records built ahead of time store references as 32-bit displacements
    pub supports_relative_pointers: bool,
}

impl Target {
    /// 64-bit target using relative pointers for build-time records
    pub const X64: Target = Target {
        pointer_size: 8,
        supports_relative_pointers: true,
    };

    /// 32-bit target using relative pointers for build-time records
    pub const X86: Target = Target {
        pointer_size: 4,
        supports_relative_pointers: true,
    };

    /// The target matching the host this crate is compiled for.
    #[must_use]
    pub const fn native() -> Self {
        Target {
            // usize is at most 8 bytes on every supported host
            pointer_size: std::mem::size_of::<usize>() as u32,
            supports_relative_pointers: true,
        }
    }

    /// Returns a copy with relative pointer support switched on or off.
    #[must_use]
    pub const fn with_relative_pointers(mut self, enabled: bool) -> Self {
        self.supports_relative_pointers = enabled;
        self
    }

    /// Size of the fixed descriptor prefix: flags, base size, related type, the two
    /// counts and the hash code.
    #[must_use]
    pub const fn fixed_prefix_size(&self) -> u32 {
        4 + 4 + self.pointer_size + 2 + 2 + 4
    }

    /// Size of the object header that precedes every heap object.
    #[must_use]
    pub const fn object_header_size(&self) -> u32 {
        self.pointer_size
    }

    /// Base size of a single-dimension, zero-lower-bound array.
    ///
    /// Header word, descriptor pointer and the element count, which is padded by one
    /// `Int32` on 64-bit targets so that the first element is pointer aligned.
    #[must_use]
    pub const fn sz_array_base_size(&self) -> u32 {
        let padding = if self.pointer_size == 8 { 1 } else { 0 };
        self.pointer_size + self.pointer_size + (1 + padding) * 4
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::native()
    }
}

/// Configuration of a [`crate::TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Target the registry lays descriptors out for
    pub target: Target,
    /// First address handed out by the registry's allocator (must be non-zero)
    pub base_address: u64,
    /// Alignment of every reserved segment (power of two, at least 8)
    pub segment_alignment: u64,
    /// Run [`crate::descriptor::validate_descriptor`] on every published descriptor
    pub validate_on_publish: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            target: Target::native(),
            base_address: 0x1_0000,
            segment_alignment: 16,
            validate_on_publish: cfg!(debug_assertions),
        }
    }
}

impl RegistryConfig {
    /// 64-bit target with relative pointers and publish-time validation
    #[must_use]
    pub fn x64() -> Self {
        Self {
            target: Target::X64,
            validate_on_publish: true,
            ..Self::default()
        }
    }

    /// 32-bit target with relative pointers and publish-time validation
    #[must_use]
    pub fn x86() -> Self {
        Self {
            target: Target::X86,
            validate_on_publish: true,
            ..Self::default()
        }
    }

    /// Configuration that skips publish-time validation.
    ///
    /// **Warning**: Use only when the producer is trusted, a malformed record is then only
    /// caught by debug assertions on first use.
    #[must_use]
    pub fn unchecked(target: Target) -> Self {
        Self {
            target,
            validate_on_publish: false,
            ..Self::default()
        }
    }

    /// Returns a copy targeting `target`.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}
