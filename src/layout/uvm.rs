//! UVM parameter structures
//!
//! Layouts follow `kernel-open/nvidia-uvm/uvm_ioctl.h`. Every command
//! structure ends with its `RMStatus` word; the trailing `Pad0` bytes bring
//! 8-byte-aligned structures back to a multiple of their alignment.
//!
//! Driver 550.40.07 widened the per-GPU attribute arrays from `UVM_MAX_GPUS`
//! to `UVM_MAX_GPUS_V2` entries and added a preferred CPU NUMA node to
//! `UVM_SET_PREFERRED_LOCATION`. Those commands carry two variants.

use crate::error::{AbiError, AbiResult};
use crate::handles::HandleKind;
use crate::layout::{ArrayLen, LayoutBuilder, LayoutDescriptor};
use crate::registry::commands::*;
use crate::registry::{Command, RegistryBuilder};
use crate::version::{DriverVersion, VersionRange};
use std::sync::Arc;

/// Oldest driver whose UVM ABI is described here
pub const BASELINE: DriverVersion = DriverVersion::new(525, 60, 13);

/// First driver with the widened per-GPU arrays
pub const V550: DriverVersion = DriverVersion::new(550, 40, 7);

/// `UVM_INITIALIZE_PARAMS.Flags` bit required for sharing the UVM file across processes
pub const UVM_INIT_FLAGS_MULTI_PROCESS_SHARING_MODE: u64 = 0x2;

/// Layout of `UvmGpuMappingAttributes`
pub fn gpu_mapping_attributes(builder: &RegistryBuilder) -> AbiResult<Arc<LayoutDescriptor>> {
    let layout = LayoutBuilder::element("UvmGpuMappingAttributes")
        .uuid("GPUUUID")
        .u32("GPUMappingType")
        .u32("GPUCachingType")
        .u32("GPUFormatType")
        .u32("GPUElementBits")
        .u32("GPUCompressionType")
        .build(builder.config())?;
    Ok(Arc::new(layout))
}

fn command(code: u32) -> AbiResult<Command> {
    lookup_command(code).copied().ok_or(AbiError::UnknownCommand(code))
}

/// Register every UVM command structure
pub fn register_uvm(builder: &mut RegistryBuilder) -> AbiResult<()> {
    let attrs = gpu_mapping_attributes(builder)?;
    let all = VersionRange::since(BASELINE);
    let before_v550 = VersionRange::new(BASELINE, V550);
    let since_v550 = VersionRange::since(V550);

    builder.register(
        command(UVM_INITIALIZE)?,
        all,
        LayoutBuilder::new("UVM_INITIALIZE_PARAMS")
            .u64("Flags")
            .status("RMStatus")
            .pad(4)
            .force_bits("Flags", UVM_INIT_FLAGS_MULTI_PROCESS_SHARING_MODE),
    )?;

    builder.register(command(UVM_DEINITIALIZE)?, all, LayoutBuilder::parameterless("UVM_DEINITIALIZE"))?;

    for (code, name) in [
        (UVM_CREATE_RANGE_GROUP, "UVM_CREATE_RANGE_GROUP_PARAMS"),
        (UVM_DESTROY_RANGE_GROUP, "UVM_DESTROY_RANGE_GROUP_PARAMS"),
    ] {
        builder.register(
            command(code)?,
            all,
            LayoutBuilder::new(name).u64("RangeGroupID").status("RMStatus").pad(4),
        )?;
    }

    builder.register(
        command(UVM_REGISTER_GPU_VASPACE)?,
        all,
        LayoutBuilder::new("UVM_REGISTER_GPU_VASPACE_PARAMS")
            .uuid("GPUUUID")
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .u32("HClient")
            .u32("HVASpace")
            .status("RMStatus"),
    )?;

    for (code, name) in [
        (UVM_UNREGISTER_GPU_VASPACE, "UVM_UNREGISTER_GPU_VASPACE_PARAMS"),
        (UVM_UNREGISTER_GPU, "UVM_UNREGISTER_GPU_PARAMS"),
    ] {
        builder.register(command(code)?, all, LayoutBuilder::new(name).uuid("GPUUUID").status("RMStatus"))?;
    }

    builder.register(
        command(UVM_REGISTER_CHANNEL)?,
        all,
        LayoutBuilder::new("UVM_REGISTER_CHANNEL_PARAMS")
            .uuid("GPUUUID")
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .u32("HClient")
            .u32("HChannel")
            .pad(4)
            .u64("Base")
            .u64("Length")
            .status("RMStatus")
            .pad(4),
    )?;

    builder.register(
        command(UVM_UNREGISTER_CHANNEL)?,
        all,
        LayoutBuilder::new("UVM_UNREGISTER_CHANNEL_PARAMS")
            .uuid("GPUUUID")
            .u32("HClient")
            .u32("HChannel")
            .status("RMStatus"),
    )?;

    for (code, name) in [
        (UVM_ENABLE_PEER_ACCESS, "UVM_ENABLE_PEER_ACCESS_PARAMS"),
        (UVM_DISABLE_PEER_ACCESS, "UVM_DISABLE_PEER_ACCESS_PARAMS"),
    ] {
        builder.register(
            command(code)?,
            all,
            LayoutBuilder::new(name).uuid("GPUUUIDA").uuid("GPUUUIDB").status("RMStatus"),
        )?;
    }

    builder.register(
        command(UVM_SET_RANGE_GROUP)?,
        all,
        LayoutBuilder::new("UVM_SET_RANGE_GROUP_PARAMS")
            .u64("RangeGroupID")
            .u64("RequestedBase")
            .u64("Length")
            .status("RMStatus")
            .pad(4),
    )?;

    builder.register(
        command(UVM_MAP_EXTERNAL_ALLOCATION)?,
        before_v550,
        LayoutBuilder::new("UVM_MAP_EXTERNAL_ALLOCATION_PARAMS")
            .u64("Base")
            .u64("Length")
            .u64("Offset")
            .array("PerGPUAttributes", &attrs, ArrayLen::MaxGpus)
            .align(8)
            // everything after the array moves once it widens
            .u64("GPUAttributesCount")
            .version_specific()
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .version_specific()
            .u32("HClient")
            .version_specific()
            .u32("HMemory")
            .version_specific()
            .status("RMStatus")
            .version_specific(),
    )?;
    builder.register(
        command(UVM_MAP_EXTERNAL_ALLOCATION)?,
        since_v550,
        LayoutBuilder::new("UVM_MAP_EXTERNAL_ALLOCATION_PARAMS_V550")
            .renamed_from("UVM_MAP_EXTERNAL_ALLOCATION_PARAMS")
            .u64("Base")
            .identical()
            .u64("Length")
            .identical()
            .u64("Offset")
            .identical()
            .array("PerGPUAttributes", &attrs, ArrayLen::MaxGpusV2)
            .align(8)
            .u64("GPUAttributesCount")
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .u32("HClient")
            .u32("HMemory")
            .status("RMStatus"),
    )?;

    for (code, name) in [
        (UVM_FREE, "UVM_FREE_PARAMS"),
        (UVM_VALIDATE_VA_RANGE, "UVM_VALIDATE_VA_RANGE_PARAMS"),
        (UVM_CREATE_EXTERNAL_RANGE, "UVM_CREATE_EXTERNAL_RANGE_PARAMS"),
    ] {
        builder.register(
            command(code)?,
            all,
            LayoutBuilder::new(name).u64("Base").u64("Length").status("RMStatus").pad(4),
        )?;
    }

    builder.register(
        command(UVM_REGISTER_GPU)?,
        all,
        LayoutBuilder::new("UVM_REGISTER_GPU_PARAMS")
            .uuid("GPUUUID")
            .u8("NumaEnabled")
            .pad(3)
            .i32("NumaNodeID")
            .handle("RMCtrlFD", HandleKind::ControlFd)
            .u32("HClient")
            .u32("HSMCPartRef")
            .status("RMStatus"),
    )?;

    builder.register(
        command(UVM_PAGEABLE_MEM_ACCESS)?,
        all,
        LayoutBuilder::new("UVM_PAGEABLE_MEM_ACCESS_PARAMS")
            .u8("PageableMemAccess")
            .pad(3)
            .status("RMStatus"),
    )?;

    builder.register(
        command(UVM_SET_PREFERRED_LOCATION)?,
        before_v550,
        LayoutBuilder::new("UVM_SET_PREFERRED_LOCATION_PARAMS")
            .u64("RequestedBase")
            .u64("Length")
            .uuid("PreferredLocation")
            .status("RMStatus")
            .version_specific()
            .pad(4),
    )?;
    builder.register(
        command(UVM_SET_PREFERRED_LOCATION)?,
        since_v550,
        LayoutBuilder::new("UVM_SET_PREFERRED_LOCATION_PARAMS_V550")
            .renamed_from("UVM_SET_PREFERRED_LOCATION_PARAMS")
            .u64("RequestedBase")
            .identical()
            .u64("Length")
            .identical()
            .uuid("PreferredLocation")
            .identical()
            .i32("PreferredCPUNumaNode")
            .version_specific()
            .status("RMStatus"),
    )?;

    builder.register(
        command(UVM_DISABLE_READ_DUPLICATION)?,
        all,
        LayoutBuilder::new("UVM_DISABLE_READ_DUPLICATION_PARAMS")
            .u64("RequestedBase")
            .u64("Length")
            .status("RMStatus")
            .pad(4),
    )?;

    builder.register(
        command(UVM_MIGRATE_RANGE_GROUP)?,
        all,
        LayoutBuilder::new("UVM_MIGRATE_RANGE_GROUP_PARAMS")
            .u64("RangeGroupID")
            .uuid("DestinationUUID")
            .status("RMStatus")
            .pad(4),
    )?;

    builder.register(
        command(UVM_TOOLS_READ_PROCESS_MEMORY)?,
        all,
        LayoutBuilder::new("UVM_TOOLS_READ_PROCESS_MEMORY_PARAMS")
            .u64("Buffer")
            .u64("Size")
            .u64("TargetVA")
            .u64("BytesRead")
            .status("RMStatus")
            .pad(4),
    )?;
    builder.register(
        command(UVM_TOOLS_WRITE_PROCESS_MEMORY)?,
        all,
        LayoutBuilder::new("UVM_TOOLS_WRITE_PROCESS_MEMORY_PARAMS")
            .u64("Buffer")
            .u64("Size")
            .u64("TargetVA")
            .u64("BytesWritten")
            .status("RMStatus")
            .pad(4),
    )?;

    for (code, name) in [
        (UVM_MAP_DYNAMIC_PARALLELISM_REGION, "UVM_MAP_DYNAMIC_PARALLELISM_REGION_PARAMS"),
        (UVM_UNMAP_EXTERNAL, "UVM_UNMAP_EXTERNAL_PARAMS"),
    ] {
        builder.register(
            command(code)?,
            all,
            LayoutBuilder::new(name).u64("Base").u64("Length").uuid("GPUUUID").status("RMStatus").pad(4),
        )?;
    }

    builder.register(
        command(UVM_ALLOC_SEMAPHORE_POOL)?,
        before_v550,
        LayoutBuilder::new("UVM_ALLOC_SEMAPHORE_POOL_PARAMS")
            .u64("Base")
            .u64("Length")
            .array("PerGPUAttributes", &attrs, ArrayLen::MaxGpus)
            .align(8)
            .u64("GPUAttributesCount")
            .version_specific()
            .status("RMStatus")
            .version_specific()
            .pad(4),
    )?;
    builder.register(
        command(UVM_ALLOC_SEMAPHORE_POOL)?,
        since_v550,
        LayoutBuilder::new("UVM_ALLOC_SEMAPHORE_POOL_PARAMS_V550")
            .renamed_from("UVM_ALLOC_SEMAPHORE_POOL_PARAMS")
            .u64("Base")
            .identical()
            .u64("Length")
            .identical()
            .array("PerGPUAttributes", &attrs, ArrayLen::MaxGpusV2)
            .align(8)
            .u64("GPUAttributesCount")
            .status("RMStatus")
            .pad(4),
    )?;

    builder.register(
        command(UVM_MM_INITIALIZE)?,
        all,
        LayoutBuilder::new("UVM_MM_INITIALIZE_PARAMS")
            .handle("UvmFD", HandleKind::UvmFd)
            .status("Status"),
    )?;

    Ok(())
}
