//! Forwarding dispatch tables.
//!
//! One table per intercepted instance and device, built once at creation by
//! resolving every forwarded entry point through the next layer's
//! get-proc-addr. The registry is the layer-wide owner, keyed by raw handle;
//! resolving a handle that was never installed is a consistency violation,
//! not a recoverable miss.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;

use crate::error::{LayerError, LayerResult};

macro_rules! resolve_required {
    ($gpa:expr, $handle:expr, $name:literal) => {
        match $gpa($handle, concat!($name, "\0").as_ptr().cast()) {
            Some(f) => std::mem::transmute(f),
            None => return Err(LayerError::Driver(vk::Result::ERROR_INITIALIZATION_FAILED)),
        }
    };
}

macro_rules! resolve_optional {
    ($gpa:expr, $handle:expr, $name:literal) => {
        match $gpa($handle, concat!($name, "\0").as_ptr().cast()) {
            Some(f) => Some(std::mem::transmute(f)),
            None => None,
        }
    };
}

/// Next-layer entry points resolved against an instance.
pub struct InstanceDispatch {
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub destroy_instance: vk::PFN_vkDestroyInstance,
    pub enumerate_physical_devices: vk::PFN_vkEnumeratePhysicalDevices,
    pub enumerate_device_extension_properties: vk::PFN_vkEnumerateDeviceExtensionProperties,
    pub get_physical_device_properties: vk::PFN_vkGetPhysicalDeviceProperties,
    pub get_physical_device_queue_family_properties:
        vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties,
}

impl InstanceDispatch {
    /// # Safety
    /// `gipa` must be the next layer's vkGetInstanceProcAddr and `instance`
    /// a handle it recognizes.
    pub unsafe fn load(
        instance: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
    ) -> LayerResult<Self> {
        Ok(Self {
            get_instance_proc_addr: gipa,
            destroy_instance: resolve_required!(gipa, instance, "vkDestroyInstance"),
            enumerate_physical_devices: resolve_required!(
                gipa,
                instance,
                "vkEnumeratePhysicalDevices"
            ),
            enumerate_device_extension_properties: resolve_required!(
                gipa,
                instance,
                "vkEnumerateDeviceExtensionProperties"
            ),
            get_physical_device_properties: resolve_required!(
                gipa,
                instance,
                "vkGetPhysicalDeviceProperties"
            ),
            get_physical_device_queue_family_properties: resolve_required!(
                gipa,
                instance,
                "vkGetPhysicalDeviceQueueFamilyProperties"
            ),
        })
    }
}

/// Next-layer entry points resolved against a device. Extension functions
/// may legitimately be absent downstream (the layer advertises the marker
/// extensions itself); those are Options and simply not forwarded.
#[derive(Debug)]
pub struct DeviceDispatch {
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub destroy_device: vk::PFN_vkDestroyDevice,
    pub get_device_queue: vk::PFN_vkGetDeviceQueue,
    pub get_device_queue2: Option<vk::PFN_vkGetDeviceQueue2>,
    pub queue_submit: vk::PFN_vkQueueSubmit,
    pub queue_present_khr: Option<vk::PFN_vkQueuePresentKHR>,
    pub device_wait_idle: vk::PFN_vkDeviceWaitIdle,
    pub reset_command_pool: vk::PFN_vkResetCommandPool,
    pub allocate_command_buffers: vk::PFN_vkAllocateCommandBuffers,
    pub free_command_buffers: vk::PFN_vkFreeCommandBuffers,
    pub begin_command_buffer: vk::PFN_vkBeginCommandBuffer,
    pub end_command_buffer: vk::PFN_vkEndCommandBuffer,
    pub reset_command_buffer: vk::PFN_vkResetCommandBuffer,
    pub create_query_pool: vk::PFN_vkCreateQueryPool,
    pub destroy_query_pool: vk::PFN_vkDestroyQueryPool,
    pub get_query_pool_results: vk::PFN_vkGetQueryPoolResults,
    pub cmd_write_timestamp: vk::PFN_vkCmdWriteTimestamp,
    /// Host query reset, EXT or core 1.2 alias. Missing downstream disables
    /// slot recycling entirely.
    pub reset_query_pool: Option<vk::PFN_vkResetQueryPool>,
    pub get_fence_status: vk::PFN_vkGetFenceStatus,
    pub cmd_begin_debug_utils_label: Option<vk::PFN_vkCmdBeginDebugUtilsLabelEXT>,
    pub cmd_end_debug_utils_label: Option<vk::PFN_vkCmdEndDebugUtilsLabelEXT>,
    pub cmd_debug_marker_begin: Option<vk::PFN_vkCmdDebugMarkerBeginEXT>,
    pub cmd_debug_marker_end: Option<vk::PFN_vkCmdDebugMarkerEndEXT>,
}

impl DeviceDispatch {
    /// # Safety
    /// `gdpa` must be the next layer's vkGetDeviceProcAddr and `device` a
    /// handle it recognizes.
    pub unsafe fn load(
        device: vk::Device,
        gdpa: vk::PFN_vkGetDeviceProcAddr,
    ) -> LayerResult<Self> {
        let mut reset_query_pool: Option<vk::PFN_vkResetQueryPool> =
            resolve_optional!(gdpa, device, "vkResetQueryPoolEXT");
        if reset_query_pool.is_none() {
            reset_query_pool = resolve_optional!(gdpa, device, "vkResetQueryPool");
        }
        Ok(Self {
            get_device_proc_addr: gdpa,
            destroy_device: resolve_required!(gdpa, device, "vkDestroyDevice"),
            get_device_queue: resolve_required!(gdpa, device, "vkGetDeviceQueue"),
            get_device_queue2: resolve_optional!(gdpa, device, "vkGetDeviceQueue2"),
            queue_submit: resolve_required!(gdpa, device, "vkQueueSubmit"),
            queue_present_khr: resolve_optional!(gdpa, device, "vkQueuePresentKHR"),
            device_wait_idle: resolve_required!(gdpa, device, "vkDeviceWaitIdle"),
            reset_command_pool: resolve_required!(gdpa, device, "vkResetCommandPool"),
            allocate_command_buffers: resolve_required!(
                gdpa,
                device,
                "vkAllocateCommandBuffers"
            ),
            free_command_buffers: resolve_required!(gdpa, device, "vkFreeCommandBuffers"),
            begin_command_buffer: resolve_required!(gdpa, device, "vkBeginCommandBuffer"),
            end_command_buffer: resolve_required!(gdpa, device, "vkEndCommandBuffer"),
            reset_command_buffer: resolve_required!(gdpa, device, "vkResetCommandBuffer"),
            create_query_pool: resolve_required!(gdpa, device, "vkCreateQueryPool"),
            destroy_query_pool: resolve_required!(gdpa, device, "vkDestroyQueryPool"),
            get_query_pool_results: resolve_required!(gdpa, device, "vkGetQueryPoolResults"),
            cmd_write_timestamp: resolve_required!(gdpa, device, "vkCmdWriteTimestamp"),
            reset_query_pool,
            get_fence_status: resolve_required!(gdpa, device, "vkGetFenceStatus"),
            cmd_begin_debug_utils_label: resolve_optional!(
                gdpa,
                device,
                "vkCmdBeginDebugUtilsLabelEXT"
            ),
            cmd_end_debug_utils_label: resolve_optional!(
                gdpa,
                device,
                "vkCmdEndDebugUtilsLabelEXT"
            ),
            cmd_debug_marker_begin: resolve_optional!(gdpa, device, "vkCmdDebugMarkerBeginEXT"),
            cmd_debug_marker_end: resolve_optional!(gdpa, device, "vkCmdDebugMarkerEndEXT"),
        })
    }
}

/// Layer-wide owner of dispatch tables, keyed by raw handle value.
#[derive(Default)]
pub struct DispatchRegistry {
    instances: DashMap<u64, Arc<InstanceDispatch>>,
    devices: DashMap<u64, Arc<DeviceDispatch>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_instance(&self, instance: vk::Instance, table: InstanceDispatch) {
        self.instances.insert(instance.as_raw(), Arc::new(table));
    }

    pub fn resolve_instance(&self, instance: vk::Instance) -> LayerResult<Arc<InstanceDispatch>> {
        self.instances
            .get(&instance.as_raw())
            .map(|t| t.clone())
            .ok_or(LayerError::UnknownHandle {
                kind: "instance",
                handle: instance.as_raw(),
            })
    }

    pub fn remove_instance(&self, instance: vk::Instance) {
        self.instances.remove(&instance.as_raw());
    }

    pub fn install_device(&self, device: vk::Device, table: Arc<DeviceDispatch>) {
        self.devices.insert(device.as_raw(), table);
    }

    pub fn resolve_device(&self, device: vk::Device) -> LayerResult<Arc<DeviceDispatch>> {
        self.devices
            .get(&device.as_raw())
            .map(|t| t.clone())
            .ok_or(LayerError::UnknownHandle {
                kind: "device",
                handle: device.as_raw(),
            })
    }

    pub fn remove_device(&self, device: vk::Device) {
        self.devices.remove(&device.as_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolving_an_unknown_handle_is_fatal() {
        let registry = DispatchRegistry::new();
        let err = registry
            .resolve_device(vk::Device::from_raw(0x42))
            .expect_err("never installed");
        assert!(err.is_fatal());
    }
}
