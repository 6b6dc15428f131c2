//! Loader-facing entry points.
//!
//! Everything the Vulkan loader calls lands here: the two exported
//! proc-addr resolvers, the chain-bootstrap for instance and device
//! creation, and the tiny extern "system" stubs that unpack raw arguments
//! and hand them to [`LayerContext`]. No timing logic lives in this module.

use std::ffi::{c_char, c_void, CStr};
use std::sync::OnceLock;

use ash::vk;
use ash::vk::Handle;
use tracing::{error, info};

use vkspan_common::logging;
use vkspan_common::VkspanConfig;
use vkspan_events::EventWriter;

use crate::context::LayerContext;
use crate::error::{LayerError, LayerResult};
use crate::metadata;

// ── Loader chain structures ─────────────────────────────────
//
// Mirrors of the vk_layer.h structs the loader threads through the pNext
// chain of vkCreateInstance / vkCreateDevice. Only the link-info shape of
// the union is ever read here.

const LAYER_LINK_INFO: u32 = 0;
const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

#[repr(C)]
struct LayerInstanceLink {
    p_next: *mut LayerInstanceLink,
    get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    get_physical_device_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
struct LayerInstanceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    layer_info: *mut LayerInstanceLink,
}

#[repr(C)]
struct LayerDeviceLink {
    p_next: *mut LayerDeviceLink,
    get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
struct LayerDeviceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    layer_info: *mut LayerDeviceLink,
}

unsafe fn find_instance_chain(
    create_info: *const vk::InstanceCreateInfo<'_>,
) -> Option<*mut LayerInstanceCreateInfo> {
    let mut cursor = (*create_info).p_next as *mut LayerInstanceCreateInfo;
    while !cursor.is_null() {
        if (*cursor).s_type == LOADER_INSTANCE_CREATE_INFO
            && (*cursor).function == LAYER_LINK_INFO
        {
            return Some(cursor);
        }
        cursor = (*cursor).p_next as *mut LayerInstanceCreateInfo;
    }
    None
}

unsafe fn find_device_chain(
    create_info: *const vk::DeviceCreateInfo<'_>,
) -> Option<*mut LayerDeviceCreateInfo> {
    let mut cursor = (*create_info).p_next as *mut LayerDeviceCreateInfo;
    while !cursor.is_null() {
        if (*cursor).s_type == LOADER_DEVICE_CREATE_INFO && (*cursor).function == LAYER_LINK_INFO
        {
            return Some(cursor);
        }
        cursor = (*cursor).p_next as *mut LayerDeviceCreateInfo;
    }
    None
}

// ── Global context ──────────────────────────────────────────

static CONTEXT: OnceLock<LayerContext> = OnceLock::new();

/// Lazily built on the first loader call: configuration, logging, and the
/// event-writer thread all come up together.
fn context() -> &'static LayerContext {
    CONTEXT.get_or_init(|| {
        let (config, config_err) = match VkspanConfig::load() {
            Ok(config) => (config, None),
            Err(err) => (VkspanConfig::default(), Some(err)),
        };
        logging::init_logging(&config.log);
        if let Some(err) = config_err {
            error!(%err, "configuration rejected, continuing with defaults");
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut writer = match &config.output_path {
            Some(path) => match EventWriter::create(path) {
                Ok(writer) => Some(writer),
                Err(err) => {
                    error!(
                        %err,
                        path = %path.display(),
                        "cannot open trace output, events will be dropped"
                    );
                    None
                }
            },
            None => None,
        };
        let spawned = std::thread::Builder::new()
            .name("vkspan-events".into())
            .spawn(move || {
                // Draining even without a writer keeps the channel bounded
                // in practice; producers never block or accumulate.
                while let Ok(event) = receiver.recv() {
                    let Some(out) = writer.as_mut() else { continue };
                    if let Err(err) = out.write(&event) {
                        error!(%err, "trace write failed, output disabled");
                        writer = None;
                    }
                }
            });
        if let Err(err) = spawned {
            error!(%err, "could not start the event writer thread");
        }

        info!(
            layer = %metadata::LAYER_NAME.to_string_lossy(),
            "layer initialized"
        );
        LayerContext::new(config, sender)
    })
}

fn fatal(err: LayerError) -> ! {
    error!(%err, "unrecoverable tracking state, aborting");
    std::process::abort();
}

fn ok_or_abort<T>(result: LayerResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(err),
    }
}

// ── Exported resolvers ──────────────────────────────────────

macro_rules! intercept {
    ($f:expr, $pfn:ty) => {
        Some(std::mem::transmute::<$pfn, unsafe extern "system" fn()>($f))
    };
}

/// Device-level interceptions, shared by both resolvers: the loader may
/// resolve device functions through either path.
unsafe fn device_level(name: &[u8]) -> Option<vk::PFN_vkVoidFunction> {
    let pfn = match name {
        b"vkGetDeviceProcAddr" => {
            intercept!(get_device_proc_addr, vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkDestroyDevice" => intercept!(destroy_device, vk::PFN_vkDestroyDevice),
        b"vkGetDeviceQueue" => intercept!(get_device_queue, vk::PFN_vkGetDeviceQueue),
        b"vkGetDeviceQueue2" => intercept!(get_device_queue2, vk::PFN_vkGetDeviceQueue2),
        b"vkQueueSubmit" => intercept!(queue_submit, vk::PFN_vkQueueSubmit),
        b"vkQueuePresentKHR" => intercept!(queue_present_khr, vk::PFN_vkQueuePresentKHR),
        b"vkResetCommandPool" => intercept!(reset_command_pool, vk::PFN_vkResetCommandPool),
        b"vkAllocateCommandBuffers" => {
            intercept!(allocate_command_buffers, vk::PFN_vkAllocateCommandBuffers)
        }
        b"vkFreeCommandBuffers" => {
            intercept!(free_command_buffers, vk::PFN_vkFreeCommandBuffers)
        }
        b"vkBeginCommandBuffer" => {
            intercept!(begin_command_buffer, vk::PFN_vkBeginCommandBuffer)
        }
        b"vkEndCommandBuffer" => intercept!(end_command_buffer, vk::PFN_vkEndCommandBuffer),
        b"vkResetCommandBuffer" => {
            intercept!(reset_command_buffer, vk::PFN_vkResetCommandBuffer)
        }
        b"vkCmdBeginDebugUtilsLabelEXT" => intercept!(
            cmd_begin_debug_utils_label,
            vk::PFN_vkCmdBeginDebugUtilsLabelEXT
        ),
        b"vkCmdEndDebugUtilsLabelEXT" => intercept!(
            cmd_end_debug_utils_label,
            vk::PFN_vkCmdEndDebugUtilsLabelEXT
        ),
        b"vkCmdDebugMarkerBeginEXT" => {
            intercept!(cmd_debug_marker_begin, vk::PFN_vkCmdDebugMarkerBeginEXT)
        }
        b"vkCmdDebugMarkerEndEXT" => {
            intercept!(cmd_debug_marker_end, vk::PFN_vkCmdDebugMarkerEndEXT)
        }
        _ => return None,
    };
    Some(pfn)
}

/// The loader's entry into this layer for instance-level resolution.
///
/// # Safety
/// Standard vkGetInstanceProcAddr contract.
#[export_name = "vkspanGetInstanceProcAddr"]
pub unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if name.is_null() {
        return None;
    }
    let bytes = CStr::from_ptr(name).to_bytes();
    match bytes {
        b"vkGetInstanceProcAddr" => {
            return intercept!(get_instance_proc_addr, vk::PFN_vkGetInstanceProcAddr)
        }
        b"vkCreateInstance" => return intercept!(create_instance, vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => return intercept!(destroy_instance, vk::PFN_vkDestroyInstance),
        b"vkCreateDevice" => return intercept!(create_device, vk::PFN_vkCreateDevice),
        b"vkEnumerateInstanceLayerProperties" => {
            return intercept!(
                enumerate_instance_layer_properties,
                vk::PFN_vkEnumerateInstanceLayerProperties
            )
        }
        b"vkEnumerateInstanceExtensionProperties" => {
            return intercept!(
                enumerate_instance_extension_properties,
                vk::PFN_vkEnumerateInstanceExtensionProperties
            )
        }
        b"vkEnumerateDeviceLayerProperties" => {
            return intercept!(
                enumerate_device_layer_properties,
                vk::PFN_vkEnumerateDeviceLayerProperties
            )
        }
        b"vkEnumerateDeviceExtensionProperties" => {
            return intercept!(
                enumerate_device_extension_properties,
                vk::PFN_vkEnumerateDeviceExtensionProperties
            )
        }
        _ => {}
    }
    if let Some(pfn) = device_level(bytes) {
        return pfn;
    }
    if instance == vk::Instance::null() {
        return None;
    }
    match context().instance_dispatch(instance) {
        Ok(table) => (table.get_instance_proc_addr)(instance, name),
        Err(_) => None,
    }
}

/// The loader's entry into this layer for device-level resolution.
///
/// # Safety
/// Standard vkGetDeviceProcAddr contract.
#[export_name = "vkspanGetDeviceProcAddr"]
pub unsafe extern "system" fn get_device_proc_addr(
    device: vk::Device,
    name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if name.is_null() {
        return None;
    }
    let bytes = CStr::from_ptr(name).to_bytes();
    if let Some(pfn) = device_level(bytes) {
        return pfn;
    }
    if device == vk::Device::null() {
        return None;
    }
    match context().device_dispatch(device) {
        Ok(table) => (table.get_device_proc_addr)(device, name),
        Err(_) => None,
    }
}

// ── Creation bootstrap ──────────────────────────────────────

unsafe extern "system" fn create_instance(
    create_info: *const vk::InstanceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    instance: *mut vk::Instance,
) -> vk::Result {
    let Some(chain) = find_instance_chain(create_info) else {
        error!("no loader instance link chain, cannot initialize");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let link = (*chain).layer_info;
    if link.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*link).get_instance_proc_addr;
    // Advance the chain so the next layer sees its own link.
    (*chain).layer_info = (*link).p_next;

    let Some(next_create) = gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let next_create: vk::PFN_vkCreateInstance = std::mem::transmute(next_create);
    let result = next_create(create_info, allocator, instance);
    if result == vk::Result::SUCCESS {
        if let Err(err) = context().on_instance_created(*instance, gipa) {
            fatal(err);
        }
    }
    result
}

unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    create_info: *const vk::DeviceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    device: *mut vk::Device,
) -> vk::Result {
    let Some(chain) = find_device_chain(create_info) else {
        error!("no loader device link chain, cannot initialize");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let link = (*chain).layer_info;
    if link.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*link).get_instance_proc_addr;
    let gdpa = (*link).get_device_proc_addr;
    (*chain).layer_info = (*link).p_next;

    let owning_instance = context()
        .instance_of(physical_device)
        .unwrap_or(vk::Instance::null());
    let Some(next_create) = gipa(owning_instance, c"vkCreateDevice".as_ptr()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let next_create: vk::PFN_vkCreateDevice = std::mem::transmute(next_create);
    let result = next_create(physical_device, create_info, allocator, device);
    if result == vk::Result::SUCCESS {
        if let Err(err) = context().on_device_created(physical_device, *device, gdpa) {
            fatal(err);
        }
    }
    result
}

// ── Enumeration ─────────────────────────────────────────────

unsafe extern "system" fn enumerate_instance_layer_properties(
    count: *mut u32,
    properties: *mut vk::LayerProperties,
) -> vk::Result {
    if count.is_null() {
        return vk::Result::SUCCESS;
    }
    if properties.is_null() {
        *count = 1;
        return vk::Result::SUCCESS;
    }
    if *count < 1 {
        *count = 0;
        return vk::Result::INCOMPLETE;
    }
    *properties = metadata::layer_properties();
    *count = 1;
    vk::Result::SUCCESS
}

unsafe extern "system" fn enumerate_device_layer_properties(
    _physical_device: vk::PhysicalDevice,
    count: *mut u32,
    properties: *mut vk::LayerProperties,
) -> vk::Result {
    enumerate_instance_layer_properties(count, properties)
}

unsafe extern "system" fn enumerate_instance_extension_properties(
    layer_name: *const c_char,
    count: *mut u32,
    _properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    // No instance-level extensions of our own; anything else belongs to
    // another layer or the loader.
    if !layer_name.is_null() && CStr::from_ptr(layer_name) == metadata::LAYER_NAME {
        *count = 0;
        return vk::Result::SUCCESS;
    }
    vk::Result::ERROR_LAYER_NOT_PRESENT
}

unsafe extern "system" fn enumerate_device_extension_properties(
    physical_device: vk::PhysicalDevice,
    layer_name: *const c_char,
    count: *mut u32,
    properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    ok_or_abort(context().enumerate_device_extension_properties(
        physical_device,
        layer_name,
        count,
        properties,
    ))
}

// ── Forwarding stubs ────────────────────────────────────────

unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    ok_or_abort(context().destroy_instance(instance, allocator));
}

unsafe extern "system" fn destroy_device(
    device: vk::Device,
    allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    ok_or_abort(context().destroy_device(device, allocator));
}

unsafe extern "system" fn get_device_queue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    queue: *mut vk::Queue,
) {
    ok_or_abort(context().get_device_queue(device, queue_family_index, queue_index, queue));
}

unsafe extern "system" fn get_device_queue2(
    device: vk::Device,
    queue_info: *const vk::DeviceQueueInfo2<'_>,
    queue: *mut vk::Queue,
) {
    ok_or_abort(context().get_device_queue2(device, queue_info, queue));
}

unsafe extern "system" fn queue_submit(
    queue: vk::Queue,
    submit_count: u32,
    submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    ok_or_abort(context().queue_submit(queue, submit_count, submits, fence))
}

unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    ok_or_abort(context().queue_present(queue, present_info))
}

unsafe extern "system" fn reset_command_pool(
    device: vk::Device,
    pool: vk::CommandPool,
    flags: vk::CommandPoolResetFlags,
) -> vk::Result {
    ok_or_abort(context().reset_command_pool(device, pool, flags))
}

unsafe extern "system" fn allocate_command_buffers(
    device: vk::Device,
    allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
    command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    ok_or_abort(context().allocate_command_buffers(device, allocate_info, command_buffers))
}

unsafe extern "system" fn free_command_buffers(
    device: vk::Device,
    pool: vk::CommandPool,
    command_buffer_count: u32,
    command_buffers: *const vk::CommandBuffer,
) {
    ok_or_abort(context().free_command_buffers(
        device,
        pool,
        command_buffer_count,
        command_buffers,
    ));
}

unsafe extern "system" fn begin_command_buffer(
    command_buffer: vk::CommandBuffer,
    begin_info: *const vk::CommandBufferBeginInfo<'_>,
) -> vk::Result {
    ok_or_abort(context().begin_command_buffer(command_buffer, begin_info))
}

unsafe extern "system" fn end_command_buffer(command_buffer: vk::CommandBuffer) -> vk::Result {
    ok_or_abort(context().end_command_buffer(command_buffer))
}

unsafe extern "system" fn reset_command_buffer(
    command_buffer: vk::CommandBuffer,
    flags: vk::CommandBufferResetFlags,
) -> vk::Result {
    ok_or_abort(context().reset_command_buffer(command_buffer, flags))
}

unsafe extern "system" fn cmd_begin_debug_utils_label(
    command_buffer: vk::CommandBuffer,
    label_info: *const vk::DebugUtilsLabelEXT<'_>,
) {
    ok_or_abort(context().cmd_begin_debug_utils_label(command_buffer, label_info));
}

unsafe extern "system" fn cmd_end_debug_utils_label(command_buffer: vk::CommandBuffer) {
    ok_or_abort(context().cmd_end_debug_utils_label(command_buffer));
}

unsafe extern "system" fn cmd_debug_marker_begin(
    command_buffer: vk::CommandBuffer,
    marker_info: *const vk::DebugMarkerMarkerInfoEXT<'_>,
) {
    ok_or_abort(context().cmd_debug_marker_begin(command_buffer, marker_info));
}

unsafe extern "system" fn cmd_debug_marker_end(command_buffer: vk::CommandBuffer) {
    ok_or_abort(context().cmd_debug_marker_end(command_buffer));
}
