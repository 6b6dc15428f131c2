//! Layer identity and extension advertisement.
//!
//! The layer presents a fixed set of device extensions (the two debug marker
//! APIs it implements itself plus host query reset, which slot recycling
//! depends on) and answers the count/VK_INCOMPLETE enumeration protocol for
//! them. The merge with downstream extension lists lives in the context,
//! since it needs a dispatch table.

use std::ffi::CStr;

use ash::vk;

pub const LAYER_NAME: &CStr = c"VK_LAYER_VKSPAN_gpu_timing";
pub const LAYER_DESCRIPTION: &CStr = c"GPU timestamp instrumentation for the vkspan profiler";
pub const LAYER_SPEC_VERSION: u32 = vk::API_VERSION_1_1;
pub const LAYER_IMPL_VERSION: u32 = 1;

fn extension(name: &CStr, spec_version: u32) -> vk::ExtensionProperties {
    let mut props = vk::ExtensionProperties {
        extension_name: [0; vk::MAX_EXTENSION_NAME_SIZE],
        spec_version,
    };
    for (dst, src) in props
        .extension_name
        .iter_mut()
        .zip(name.to_bytes_with_nul())
    {
        *dst = *src as std::ffi::c_char;
    }
    props
}

/// The device extensions this layer provides on top of whatever the driver
/// has.
pub fn device_extensions() -> [vk::ExtensionProperties; 3] {
    [
        extension(ash::ext::debug_marker::NAME, ash::ext::debug_marker::SPEC_VERSION),
        extension(ash::ext::debug_utils::NAME, ash::ext::debug_utils::SPEC_VERSION),
        extension(
            ash::ext::host_query_reset::NAME,
            ash::ext::host_query_reset::SPEC_VERSION,
        ),
    ]
}

pub fn layer_properties() -> vk::LayerProperties {
    let mut props = vk::LayerProperties {
        layer_name: [0; vk::MAX_EXTENSION_NAME_SIZE],
        spec_version: LAYER_SPEC_VERSION,
        implementation_version: LAYER_IMPL_VERSION,
        description: [0; vk::MAX_DESCRIPTION_SIZE],
    };
    for (dst, src) in props.layer_name.iter_mut().zip(LAYER_NAME.to_bytes_with_nul()) {
        *dst = *src as std::ffi::c_char;
    }
    for (dst, src) in props
        .description
        .iter_mut()
        .zip(LAYER_DESCRIPTION.to_bytes_with_nul())
    {
        *dst = *src as std::ffi::c_char;
    }
    props
}

pub fn extension_name_of(props: &vk::ExtensionProperties) -> &CStr {
    // Vulkan guarantees extension_name is nul-terminated.
    unsafe { CStr::from_ptr(props.extension_name.as_ptr()) }
}

/// The count/VK_INCOMPLETE copy protocol over an arbitrary extension list.
/// `out == None` answers only the count.
pub fn copy_extensions(
    extensions: &[vk::ExtensionProperties],
    count: &mut u32,
    out: Option<&mut [vk::ExtensionProperties]>,
) -> vk::Result {
    let Some(out) = out else {
        *count = extensions.len() as u32;
        return vk::Result::SUCCESS;
    };
    let to_copy = (*count as usize).min(extensions.len()).min(out.len());
    out[..to_copy].copy_from_slice(&extensions[..to_copy]);
    *count = to_copy as u32;
    if to_copy < extensions.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_extension_set_is_fixed() {
        let extensions = device_extensions();
        let names: Vec<&CStr> = extensions.iter().map(extension_name_of).collect();
        assert_eq!(
            names,
            vec![
                ash::ext::debug_marker::NAME,
                ash::ext::debug_utils::NAME,
                ash::ext::host_query_reset::NAME,
            ]
        );
    }

    #[test]
    fn count_only_query_reports_three() {
        let mut count = 0;
        let result = copy_extensions(&device_extensions(), &mut count, None);
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
    }

    #[test]
    fn short_buffer_yields_incomplete() {
        let mut out = [vk::ExtensionProperties::default(); 2];
        let mut count = 2;
        let result = copy_extensions(&device_extensions(), &mut count, Some(&mut out));
        assert_eq!(result, vk::Result::INCOMPLETE);
        assert_eq!(count, 2);
        assert_eq!(
            extension_name_of(&out[0]),
            ash::ext::debug_marker::NAME
        );
    }

    #[test]
    fn exact_buffer_yields_success() {
        let mut out = [vk::ExtensionProperties::default(); 3];
        let mut count = 3;
        let result = copy_extensions(&device_extensions(), &mut count, Some(&mut out));
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 3);
    }

    #[test]
    fn layer_properties_carry_the_name() {
        let props = layer_properties();
        let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
        assert_eq!(name, LAYER_NAME);
        assert_eq!(props.implementation_version, LAYER_IMPL_VERSION);
    }
}
