#![no_main]

use libfuzzer_sys::fuzz_target;
use methodtable::descriptor::{validate_descriptor, validate_staged};
use methodtable::memory::Address;
use methodtable::{RegistryConfig, Target, TypeRegistry};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let target = if data[0] & 1 == 0 { Target::X64 } else { Target::X86 };
    let registry = TypeRegistry::new(RegistryConfig::unchecked(target));
    let base = Address::new(0x4000_0000);

    let staged = validate_staged(registry.space(), base, data, base);

    if registry.map_image(base, data.to_vec(), &[0]).is_ok() {
        let _ = registry.validate();
        // Nothing else is mapped, so both entry points must agree
        assert_eq!(
            staged.is_ok(),
            validate_descriptor(registry.space(), base).is_ok()
        );
    }
});
