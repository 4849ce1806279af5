//! Structural validation of descriptors of unknown origin.
//!
//! Accessors on [`crate::descriptor::MethodTable`] trust the record. Records that come from
//! outside (a mapped image, a fuzzer) are checked here first, with bounds-checked reads only,
//! so that validation reports [`crate::Error::Malformed`] instead of tripping an assertion.
//!
//! Checks performed:
//! - the element type decodes and agrees with the kind and shape
//! - component size and extended flags are used consistently
//! - the related type is set when the kind requires one
//! - the record, sized by its own flags, fits inside its segment
//! - a dispatch map is mapped and its counts fit the blob
//! - generic definitions, argument vectors and variance arrays resolve
//!
//! [`validate_staged`] runs the same checks on a record that is still private to its
//! producer, so a defective record is rejected before anything can observe it.

use crate::{
    config::Target,
    descriptor::{
        dispatch::{DispatchCounts, DISPATCH_MAP_HEADER_SIZE},
        flags::{ElementType, TypeKind},
        generics::GenericVariance,
        layout::{descriptor_size, field_offset, stored_dynamic_flags, DescriptorField, FixedPrefix},
        shape::{ParameterizedShape, TypeShape},
    },
    memory::{Address, AddressSpace, Pointer},
    Error, Result,
};

/// Checks the fixed prefix on its own, without following any reference.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] describing the first inconsistency found.
pub fn validate_prefix(prefix: &FixedPrefix, target: &Target) -> Result<()> {
    let flags = prefix.flags;
    let Some(element_type) = ElementType::from_repr(flags.element_type_raw()) else {
        return Err(malformed_error!(
            "unknown element type 0x{:02x}",
            flags.element_type_raw()
        ));
    };

    let sz_array = target.sz_array_base_size();
    match prefix.shape() {
        TypeShape::Object { .. } => {
            if matches!(
                element_type,
                ElementType::Array
                    | ElementType::SzArray
                    | ElementType::ByRef
                    | ElementType::Pointer
                    | ElementType::FunctionPointer
            ) {
                return Err(malformed_error!(
                    "canonical descriptor with element type {}",
                    element_type
                ));
            }
        }
        TypeShape::Parameterized(shape) => {
            match (shape, element_type) {
                (ParameterizedShape::Pointer, ElementType::Pointer)
                | (ParameterizedShape::ByRef, ElementType::ByRef) => {}
                (ParameterizedShape::Array { base_size }, ElementType::SzArray)
                    if base_size == sz_array => {}
                (ParameterizedShape::Array { base_size }, ElementType::Array)
                    if base_size > sz_array && (base_size - sz_array) % 8 == 0 => {}
                _ => {
                    return Err(malformed_error!(
                        "parameterized shape {:?} does not match element type {}",
                        shape,
                        element_type
                    ))
                }
            }
            if prefix.related_type.is_null() {
                return Err(malformed_error!("parameterized descriptor without element type"));
            }
        }
        TypeShape::GenericDefinition { parameter_count } => {
            if prefix.raw_base_size > u32::from(u16::MAX) {
                return Err(malformed_error!(
                    "generic definition with {} parameters",
                    prefix.raw_base_size
                ));
            }
            if parameter_count == 0 {
                return Err(malformed_error!("generic definition without parameters"));
            }
        }
        TypeShape::FunctionPointer { .. } => {
            if element_type != ElementType::FunctionPointer {
                return Err(malformed_error!(
                    "function pointer descriptor with element type {}",
                    element_type
                ));
            }
            if prefix.related_type.is_null() {
                return Err(malformed_error!("function pointer without return type"));
            }
        }
    }

    if flags.is_array() && !flags.has_component_size() {
        return Err(malformed_error!("array descriptor without component size"));
    }
    if flags.has_component_size() && flags.component_size() == 0 {
        return Err(malformed_error!("component size flag set with zero size"));
    }
    if flags.is_generic() && flags.kind() != TypeKind::Canonical {
        return Err(malformed_error!(
            "instantiated generic flag on {} descriptor",
            flags.kind()
        ));
    }
    if flags.has_generic_variance() && !flags.is_generic() && !flags.is_generic_type_definition()
    {
        return Err(malformed_error!("variance flag on non-generic descriptor"));
    }

    Ok(())
}

/// Where validation resolves the references a record holds: published segments, plus at
/// most one staged image that has not been installed yet.
struct Lookup<'a> {
    space: &'a AddressSpace,
    staged: Option<(Address, &'a [u8])>,
}

impl Lookup<'_> {
    fn staged_offset(&self, address: Address) -> Option<(&[u8], usize)> {
        let (base, bytes) = self.staged?;
        let offset = usize::try_from(address.0.checked_sub(base.0)?).ok()?;
        (offset < bytes.len()).then_some((bytes, offset))
    }

    fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>> {
        match self.staged_offset(address) {
            Some((bytes, offset)) => offset
                .checked_add(len)
                .and_then(|end| bytes.get(offset..end))
                .map(<[u8]>::to_vec)
                .ok_or(Error::OutOfBounds),
            None => self.space.read_bytes(address, len),
        }
    }

    fn prefix(&self, address: Address) -> Result<FixedPrefix> {
        let target = self.space.target();
        if let Some((bytes, offset)) = self.staged_offset(address) {
            return FixedPrefix::read(&bytes[offset..], &target);
        }
        let segment = self.space.segment(address).ok_or(Error::Unmapped(address))?;
        let start = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        FixedPrefix::read(&segment.bytes()[start..], &target)
    }
}

/// Validates the descriptor published at `address` without panicking on corrupt input.
///
/// # Errors
/// Returns [`Error::Unmapped`] if `address` is not published, and
/// [`crate::Error::Malformed`] for any structural defect.
pub fn validate_descriptor(space: &AddressSpace, address: Address) -> Result<()> {
    let segment = space
        .segment(address)
        .ok_or(Error::Unmapped(address))?;
    let start = segment
        .offset_of(address)
        .ok_or(Error::Unmapped(address))?;

    let lookup = Lookup {
        space,
        staged: None,
    };
    validate_record(&lookup, address, &segment.bytes()[start..])
}

/// Validates the descriptor at `address` inside `image`, which is meant to be installed at
/// `base` but is not visible to readers yet.
///
/// References are resolved inside `image` first and in the published segments of `space`
/// otherwise, so a record can be checked before the single step that publishes it.
///
/// # Errors
/// Returns [`Error::Unmapped`] if `address` lies outside `image`, and
/// [`crate::Error::Malformed`] for any structural defect.
pub fn validate_staged(
    space: &AddressSpace,
    base: Address,
    image: &[u8],
    address: Address,
) -> Result<()> {
    let lookup = Lookup {
        space,
        staged: Some((base, image)),
    };
    let (data, start) = lookup
        .staged_offset(address)
        .ok_or(Error::Unmapped(address))?;
    validate_record(&lookup, address, &data[start..])
}

fn validate_record(lookup: &Lookup<'_>, address: Address, data: &[u8]) -> Result<()> {
    let target = lookup.space.target();
    let prefix = FixedPrefix::read(data, &target)
        .map_err(|_| malformed_error!("truncated fixed prefix at {}", address))?;
    validate_prefix(&prefix, &target)?;

    let dynamic = stored_dynamic_flags(&prefix, data, &target)
        .map_err(|_| malformed_error!("dynamic flags word outside segment"))?;
    let size = descriptor_size(&prefix, &target, &dynamic) as usize;
    if size > data.len() {
        return Err(malformed_error!(
            "record of {} bytes overruns segment with {} bytes left",
            size,
            data.len()
        ));
    }

    let mode = prefix.pointer_mode(&target);
    let field = |field: DescriptorField| -> Result<Address> {
        let offset = field_offset(&prefix, &target, &dynamic, field) as usize;
        Ok(Pointer::decode(data, offset, address, mode, &target)?.resolve())
    };

    if prefix.flags.has_dispatch_map() {
        let map = field(DescriptorField::DispatchMap)?;
        lookup
            .read_bytes(map, DISPATCH_MAP_HEADER_SIZE)
            .and_then(|header| DispatchCounts::read(&header))
            .and_then(|counts| lookup.read_bytes(map, counts.blob_size()))
            .map_err(|error| malformed_error!("dispatch map at {}: {}", map, error))?;
    }

    if prefix.flags.is_generic() {
        let definition = field(DescriptorField::GenericDefinition)?;
        let arity = generic_definition_arity(lookup, definition)?;
        if arity > 1 {
            let head = field(DescriptorField::GenericComposition)?;
            lookup
                .read_bytes(head, arity * mode.width(&target) as usize)
                .map_err(|error| malformed_error!("generic arguments at {}: {}", head, error))?;
        }
    } else if prefix.flags.is_generic_type_definition() && prefix.flags.has_generic_variance() {
        let variance = field(DescriptorField::GenericComposition)?;
        let count = match prefix.shape() {
            TypeShape::GenericDefinition { parameter_count } => usize::from(parameter_count),
            _ => 0,
        };
        let bytes = lookup
            .read_bytes(variance, count)
            .map_err(|error| malformed_error!("variance at {}: {}", variance, error))?;
        if let Some(raw) = bytes
            .iter()
            .find(|raw| GenericVariance::from_repr(**raw).is_none())
        {
            return Err(malformed_error!("unknown variance byte 0x{:02x}", raw));
        }
    }

    Ok(())
}

fn generic_definition_arity(lookup: &Lookup<'_>, definition: Address) -> Result<usize> {
    let prefix = lookup.prefix(definition).map_err(|error| {
        malformed_error!("generic definition {} is unreadable: {}", definition, error)
    })?;

    match prefix.shape() {
        TypeShape::GenericDefinition { parameter_count } => Ok(usize::from(parameter_count)),
        shape => Err(malformed_error!(
            "generic definition {} has shape {:?}",
            definition,
            shape
        )),
    }
}
