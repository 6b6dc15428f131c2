//! The layer context: one explicitly constructed object composing the
//! dispatch registry, the per-device timing state, and the queue registry.
//!
//! Every intercepted call lands here from the entry shim. The contract
//! throughout: the forwarded call's side effects and return value are never
//! altered by bookkeeping failures. Methods return `Err` only for the
//! fatal consistency-violation class (handles this layer never observed);
//! every other internal failure is logged and degrades tracing fidelity.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use crossbeam_channel::Sender;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use vkspan_common::clock::monotonic_ns;
use vkspan_common::VkspanConfig;
use vkspan_events::TraceEvent;

use crate::device::DeviceState;
use crate::device_ops::DriverBackend;
use crate::dispatch::{DeviceDispatch, DispatchRegistry, InstanceDispatch};
use crate::error::{LayerError, LayerResult};
use crate::metadata;
use crate::queue_registry::QueueRegistry;

pub struct LayerContext {
    dispatch: DispatchRegistry,
    devices: DashMap<u64, Arc<DeviceState>>,
    /// Physical device -> owning instance, filled at instance creation.
    physical_device_instance: DashMap<u64, u64>,
    /// Command buffer -> owning device, for calls that only get a buffer.
    command_buffer_owner: DashMap<u64, u64>,
    queues: QueueRegistry,
    events: Sender<TraceEvent>,
    config: VkspanConfig,
}

impl LayerContext {
    pub fn new(config: VkspanConfig, events: Sender<TraceEvent>) -> Self {
        Self {
            dispatch: DispatchRegistry::new(),
            devices: DashMap::new(),
            physical_device_instance: DashMap::new(),
            command_buffer_owner: DashMap::new(),
            queues: QueueRegistry::new(),
            events,
            config,
        }
    }

    // ── Instance lifecycle ──────────────────────────────────

    /// Post-call of instance creation: build the forwarding table and learn
    /// which physical devices belong to this instance (needed later to
    /// resolve device limits at device creation).
    ///
    /// # Safety
    /// `instance` must be the handle just returned by the next layer and
    /// `gipa` the chain's get-instance-proc-addr for it.
    pub unsafe fn on_instance_created(
        &self,
        instance: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
    ) -> LayerResult<()> {
        let table = InstanceDispatch::load(instance, gipa)?;

        let mut count = 0u32;
        let result =
            (table.enumerate_physical_devices)(instance, &mut count, std::ptr::null_mut());
        if result == vk::Result::SUCCESS && count > 0 {
            let mut physical_devices = vec![vk::PhysicalDevice::null(); count as usize];
            let result = (table.enumerate_physical_devices)(
                instance,
                &mut count,
                physical_devices.as_mut_ptr(),
            );
            if result == vk::Result::SUCCESS {
                for pd in &physical_devices[..count as usize] {
                    self.physical_device_instance
                        .insert(pd.as_raw(), instance.as_raw());
                }
            }
        }

        self.dispatch.install_instance(instance, table);
        info!(
            instance = format_args!("{:#x}", instance.as_raw()),
            "instance intercepted"
        );
        Ok(())
    }

    /// # Safety
    /// Standard vkDestroyInstance contract.
    pub unsafe fn destroy_instance(
        &self,
        instance: vk::Instance,
        allocator: *const vk::AllocationCallbacks<'_>,
    ) -> LayerResult<()> {
        let table = self.dispatch.resolve_instance(instance)?;
        (table.destroy_instance)(instance, allocator);
        self.physical_device_instance
            .retain(|_, owner| *owner != instance.as_raw());
        self.dispatch.remove_instance(instance);
        Ok(())
    }

    pub fn instance_of(&self, physical_device: vk::PhysicalDevice) -> LayerResult<vk::Instance> {
        self.physical_device_instance
            .get(&physical_device.as_raw())
            .map(|i| vk::Instance::from_raw(*i))
            .ok_or(LayerError::UnknownHandle {
                kind: "physical device",
                handle: physical_device.as_raw(),
            })
    }

    pub fn instance_dispatch(
        &self,
        instance: vk::Instance,
    ) -> LayerResult<Arc<InstanceDispatch>> {
        self.dispatch.resolve_instance(instance)
    }

    pub fn device_dispatch(&self, device: vk::Device) -> LayerResult<Arc<DeviceDispatch>> {
        self.dispatch.resolve_device(device)
    }

    // ── Device lifecycle ────────────────────────────────────

    /// Post-call of device creation: resolve the forwarding table, read the
    /// timestamp characteristics from the physical device, and stand up the
    /// per-device timing state.
    ///
    /// # Safety
    /// `device` must be the handle just returned by the next layer and
    /// `gdpa` the chain's get-device-proc-addr for it.
    pub unsafe fn on_device_created(
        &self,
        physical_device: vk::PhysicalDevice,
        device: vk::Device,
        gdpa: vk::PFN_vkGetDeviceProcAddr,
    ) -> LayerResult<()> {
        let table = Arc::new(DeviceDispatch::load(device, gdpa)?);
        if table.reset_query_pool.is_none() {
            warn!("host query reset unavailable downstream, GPU timing disabled for this device");
        }

        let instance_table = self.instance_dispatch(self.instance_of(physical_device)?)?;
        let mut properties = vk::PhysicalDeviceProperties::default();
        (instance_table.get_physical_device_properties)(physical_device, &mut properties);

        let mut family_count = 0u32;
        (instance_table.get_physical_device_queue_family_properties)(
            physical_device,
            &mut family_count,
            std::ptr::null_mut(),
        );
        let mut families =
            vec![vk::QueueFamilyProperties::default(); family_count as usize];
        (instance_table.get_physical_device_queue_family_properties)(
            physical_device,
            &mut family_count,
            families.as_mut_ptr(),
        );
        let valid_bits = families
            .iter()
            .map(|f| f.timestamp_valid_bits)
            .filter(|&bits| bits > 0)
            .min()
            .unwrap_or(64);

        let backend = Arc::new(DriverBackend::new(
            device,
            table.clone(),
            properties.limits.timestamp_period,
            valid_bits,
            self.config.max_slots,
        ));
        let state = Arc::new(DeviceState::new(
            device.as_raw(),
            backend,
            self.events.clone(),
            self.config.initial_slots,
        ));

        self.devices.insert(device.as_raw(), state);
        self.dispatch.install_device(device, table);
        info!(
            device = format_args!("{:#x}", device.as_raw()),
            timestamp_period = properties.limits.timestamp_period,
            valid_bits,
            "device intercepted"
        );
        Ok(())
    }

    /// # Safety
    /// Standard vkDestroyDevice contract.
    pub unsafe fn destroy_device(
        &self,
        device: vk::Device,
        allocator: *const vk::AllocationCallbacks<'_>,
    ) -> LayerResult<()> {
        let table = self.dispatch.resolve_device(device)?;
        if let Some((_, state)) = self.devices.remove(&device.as_raw()) {
            // Let in-flight work finish so the final drain retires spans
            // instead of reporting losses.
            let _ = (table.device_wait_idle)(device);
            state.drain();
        }
        self.queues.invalidate_device(device.as_raw());
        self.command_buffer_owner
            .retain(|_, owner| *owner != device.as_raw());
        (table.destroy_device)(device, allocator);
        self.dispatch.remove_device(device);
        Ok(())
    }

    pub fn device_state(&self, device: u64) -> LayerResult<Arc<DeviceState>> {
        self.devices
            .get(&device)
            .map(|s| s.clone())
            .ok_or(LayerError::UnknownHandle {
                kind: "device",
                handle: device,
            })
    }

    fn owner_of(&self, command_buffer: vk::CommandBuffer) -> LayerResult<Arc<DeviceState>> {
        let device = self
            .command_buffer_owner
            .get(&command_buffer.as_raw())
            .map(|d| *d)
            .ok_or(LayerError::UnknownHandle {
                kind: "command buffer",
                handle: command_buffer.as_raw(),
            })?;
        self.device_state(device)
    }

    // ── Command pool / buffer lifecycle ─────────────────────

    /// # Safety
    /// Standard vkResetCommandPool contract.
    pub unsafe fn reset_command_pool(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> LayerResult<vk::Result> {
        let table = self.dispatch.resolve_device(device)?;
        let result = (table.reset_command_pool)(device, pool, flags);
        if result == vk::Result::SUCCESS {
            self.device_state(device.as_raw())?.on_reset_pool(pool.as_raw());
        }
        Ok(result)
    }

    /// # Safety
    /// Standard vkAllocateCommandBuffers contract.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: vk::Device,
        allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
        command_buffers: *mut vk::CommandBuffer,
    ) -> LayerResult<vk::Result> {
        let table = self.dispatch.resolve_device(device)?;
        let result = (table.allocate_command_buffers)(device, allocate_info, command_buffers);
        if result == vk::Result::SUCCESS && !allocate_info.is_null() {
            let info = &*allocate_info;
            let buffers: Vec<u64> = (0..info.command_buffer_count as usize)
                .map(|i| (*command_buffers.add(i)).as_raw())
                .collect();
            for &buffer in &buffers {
                self.command_buffer_owner.insert(buffer, device.as_raw());
            }
            self.device_state(device.as_raw())?
                .on_allocate_command_buffers(info.command_pool.as_raw(), &buffers);
        }
        Ok(result)
    }

    /// # Safety
    /// Standard vkFreeCommandBuffers contract.
    pub unsafe fn free_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        command_buffer_count: u32,
        command_buffers: *const vk::CommandBuffer,
    ) -> LayerResult<()> {
        let table = self.dispatch.resolve_device(device)?;
        if !command_buffers.is_null() {
            let buffers: Vec<u64> = (0..command_buffer_count as usize)
                .map(|i| (*command_buffers.add(i)).as_raw())
                .filter(|&b| b != 0)
                .collect();
            self.device_state(device.as_raw())?
                .on_free_command_buffers(&buffers);
            for buffer in &buffers {
                self.command_buffer_owner.remove(buffer);
            }
        }
        (table.free_command_buffers)(device, pool, command_buffer_count, command_buffers);
        Ok(())
    }

    /// # Safety
    /// Standard vkBeginCommandBuffer contract.
    pub unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: *const vk::CommandBufferBeginInfo<'_>,
    ) -> LayerResult<vk::Result> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        let result = (table.begin_command_buffer)(command_buffer, begin_info);
        if result == vk::Result::SUCCESS {
            if let Err(err) = state.on_begin_command_buffer(command_buffer.as_raw()) {
                warn!(%err, "begin-recording tracking failed");
            }
        }
        Ok(result)
    }

    /// # Safety
    /// Standard vkEndCommandBuffer contract.
    pub unsafe fn end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> LayerResult<vk::Result> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        // The closing timestamp must be recorded while the buffer still
        // accepts commands, so tracking runs before the forward.
        if let Err(err) = state.on_end_command_buffer(command_buffer.as_raw()) {
            warn!(%err, "end-recording tracking failed");
        }
        Ok((table.end_command_buffer)(command_buffer))
    }

    /// # Safety
    /// Standard vkResetCommandBuffer contract.
    pub unsafe fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> LayerResult<vk::Result> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        if let Err(err) = state.on_reset_command_buffer(command_buffer.as_raw()) {
            warn!(%err, "reset tracking failed");
        }
        Ok((table.reset_command_buffer)(command_buffer, flags))
    }

    // ── Queues ──────────────────────────────────────────────

    /// # Safety
    /// Standard vkGetDeviceQueue contract.
    pub unsafe fn get_device_queue(
        &self,
        device: vk::Device,
        family: u32,
        index: u32,
        queue: *mut vk::Queue,
    ) -> LayerResult<()> {
        let table = self.dispatch.resolve_device(device)?;
        (table.get_device_queue)(device, family, index, queue);
        if !queue.is_null() {
            self.queues
                .register((*queue).as_raw(), device.as_raw(), family, index);
        }
        Ok(())
    }

    /// # Safety
    /// Standard vkGetDeviceQueue2 contract.
    pub unsafe fn get_device_queue2(
        &self,
        device: vk::Device,
        queue_info: *const vk::DeviceQueueInfo2<'_>,
        queue: *mut vk::Queue,
    ) -> LayerResult<()> {
        let table = self.dispatch.resolve_device(device)?;
        let info = &*queue_info;
        match table.get_device_queue2 {
            Some(next) => next(device, queue_info, queue),
            // 1.0 drivers: fall back to the flag-less path.
            None => (table.get_device_queue)(
                device,
                info.queue_family_index,
                info.queue_index,
                queue,
            ),
        }
        if !queue.is_null() {
            self.queues.register(
                (*queue).as_raw(),
                device.as_raw(),
                info.queue_family_index,
                info.queue_index,
            );
        }
        Ok(())
    }

    // ── Submission / presentation ───────────────────────────

    /// # Safety
    /// Standard vkQueueSubmit contract.
    pub unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submit_count: u32,
        submits: *const vk::SubmitInfo<'_>,
        fence: vk::Fence,
    ) -> LayerResult<vk::Result> {
        let record = self.queues.lookup(queue.as_raw())?;
        let state = self.device_state(record.device)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(record.device))?;

        let cpu_submit_ns = monotonic_ns();
        let result = (table.queue_submit)(queue, submit_count, submits, fence);
        if result != vk::Result::SUCCESS {
            return Ok(result);
        }

        let mut buffers = Vec::new();
        for i in 0..submit_count as usize {
            let submit = &*submits.add(i);
            for j in 0..submit.command_buffer_count as usize {
                buffers.push((*submit.p_command_buffers.add(j)).as_raw());
            }
        }
        let fence = (fence != vk::Fence::null()).then_some(fence);
        if let Err(err) =
            state.on_queue_submit(queue.as_raw(), &buffers, fence, cpu_submit_ns)
        {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(%err, "submit tracking failed, gap in trace");
        }
        Ok(result)
    }

    /// # Safety
    /// Standard vkQueuePresentKHR contract.
    pub unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: *const vk::PresentInfoKHR<'_>,
    ) -> LayerResult<vk::Result> {
        let record = self.queues.lookup(queue.as_raw())?;
        let state = self.device_state(record.device)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(record.device))?;
        let Some(next) = table.queue_present_khr else {
            // The application resolved presentation through this layer while
            // the chain below has no swapchain support.
            return Ok(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        };
        let cpu_ns = monotonic_ns();
        let result = next(queue, present_info);
        state.on_queue_present(queue.as_raw(), cpu_ns);
        Ok(result)
    }

    // ── Markers ─────────────────────────────────────────────

    /// # Safety
    /// Standard vkCmdBeginDebugUtilsLabelEXT contract.
    pub unsafe fn cmd_begin_debug_utils_label(
        &self,
        command_buffer: vk::CommandBuffer,
        label_info: *const vk::DebugUtilsLabelEXT<'_>,
    ) -> LayerResult<()> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        if let Some(next) = table.cmd_begin_debug_utils_label {
            next(command_buffer, label_info);
        }
        let label = label_name((*label_info).p_label_name);
        self.open_marker(&state, command_buffer, &label);
        Ok(())
    }

    /// # Safety
    /// Standard vkCmdEndDebugUtilsLabelEXT contract.
    pub unsafe fn cmd_end_debug_utils_label(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> LayerResult<()> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        self.close_marker(&state, command_buffer);
        if let Some(next) = table.cmd_end_debug_utils_label {
            next(command_buffer);
        }
        Ok(())
    }

    /// # Safety
    /// Standard vkCmdDebugMarkerBeginEXT contract.
    pub unsafe fn cmd_debug_marker_begin(
        &self,
        command_buffer: vk::CommandBuffer,
        marker_info: *const vk::DebugMarkerMarkerInfoEXT<'_>,
    ) -> LayerResult<()> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        if let Some(next) = table.cmd_debug_marker_begin {
            next(command_buffer, marker_info);
        }
        let label = label_name((*marker_info).p_marker_name);
        self.open_marker(&state, command_buffer, &label);
        Ok(())
    }

    /// # Safety
    /// Standard vkCmdDebugMarkerEndEXT contract.
    pub unsafe fn cmd_debug_marker_end(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> LayerResult<()> {
        let state = self.owner_of(command_buffer)?;
        let table = self.dispatch.resolve_device(vk::Device::from_raw(state.raw()))?;
        self.close_marker(&state, command_buffer);
        if let Some(next) = table.cmd_debug_marker_end {
            next(command_buffer);
        }
        Ok(())
    }

    fn open_marker(&self, state: &DeviceState, command_buffer: vk::CommandBuffer, label: &str) {
        if let Err(err) = state.on_marker_begin(command_buffer.as_raw(), label) {
            warn!(%err, label, "marker begin tracking failed");
        }
    }

    fn close_marker(&self, state: &DeviceState, command_buffer: vk::CommandBuffer) {
        if let Err(err) = state.on_marker_end(command_buffer.as_raw()) {
            warn!(%err, "marker end tracking failed");
        }
    }

    // ── Extension enumeration ───────────────────────────────

    /// Device extension enumeration with the layer's set merged in. Queries
    /// naming this layer are answered from the fixed set alone; queries
    /// naming another layer are forwarded untouched; the general query gets
    /// the downstream list plus whichever of ours are not already present.
    ///
    /// # Safety
    /// Standard vkEnumerateDeviceExtensionProperties contract.
    pub unsafe fn enumerate_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        layer_name: *const std::ffi::c_char,
        count: *mut u32,
        properties: *mut vk::ExtensionProperties,
    ) -> LayerResult<vk::Result> {
        if !layer_name.is_null() {
            let name = CStr::from_ptr(layer_name);
            if name == metadata::LAYER_NAME {
                let own = metadata::device_extensions();
                let out = if properties.is_null() {
                    None
                } else {
                    Some(std::slice::from_raw_parts_mut(properties, *count as usize))
                };
                return Ok(metadata::copy_extensions(&own, &mut *count, out));
            }
        }

        let table = self.instance_dispatch(self.instance_of(physical_device)?)?;
        if !layer_name.is_null() {
            return Ok((table.enumerate_device_extension_properties)(
                physical_device,
                layer_name,
                count,
                properties,
            ));
        }

        let mut downstream_count = 0u32;
        let result = (table.enumerate_device_extension_properties)(
            physical_device,
            std::ptr::null(),
            &mut downstream_count,
            std::ptr::null_mut(),
        );
        if result != vk::Result::SUCCESS {
            return Ok(result);
        }
        let mut extensions =
            vec![vk::ExtensionProperties::default(); downstream_count as usize];
        let result = (table.enumerate_device_extension_properties)(
            physical_device,
            std::ptr::null(),
            &mut downstream_count,
            extensions.as_mut_ptr(),
        );
        if result != vk::Result::SUCCESS {
            return Ok(result);
        }
        extensions.truncate(downstream_count as usize);

        // The layer's set is tiny; quadratic dedup is fine.
        for own in metadata::device_extensions() {
            let name = metadata::extension_name_of(&own);
            if !extensions
                .iter()
                .any(|e| metadata::extension_name_of(e) == name)
            {
                extensions.push(own);
            }
        }

        let out = if properties.is_null() {
            None
        } else {
            Some(std::slice::from_raw_parts_mut(properties, *count as usize))
        };
        Ok(metadata::copy_extensions(&extensions, &mut *count, out))
    }

    // ── Readback ────────────────────────────────────────────

    /// One retirement pass over every tracked device; exposed so sync points
    /// other than submit/present can drive readback.
    pub fn poll_all(&self) {
        for entry in self.devices.iter() {
            let retired = entry.value().poll_retirement();
            if retired > 0 {
                debug!(retired, "retired submissions");
            }
        }
    }
}

/// Lossy read of a driver-supplied label string; null maps to the empty name.
///
/// # Safety
/// `ptr`, when non-null, must point at a nul-terminated string.
unsafe fn label_name(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
