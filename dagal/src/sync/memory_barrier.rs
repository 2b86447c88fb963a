#[cfg(feature = "vulkan")]
use ash::vk;

bitflags::bitflags! {
    /// API neutral memory access flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const TRANSFER_READ = 1 << 0;
        const TRANSFER_WRITE = 1 << 1;
        const HOST_WRITE = 1 << 2;
        const MEMORY_READ = 1 << 3;
        const MEMORY_WRITE = 1 << 4;
    }
}

bitflags::bitflags! {
    /// API neutral pipeline stages
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const HOST = 1 << 1;
        const TRANSFER = 1 << 2;
        const ALL_COMMANDS = 1 << 3;
        const BOTTOM_OF_PIPE = 1 << 4;
    }
}

/// A global memory barrier
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage_mask: PipelineStage,
    pub src_access_mask: AccessFlags,
    pub dst_stage_mask: PipelineStage,
    pub dst_access_mask: AccessFlags,
}

impl MemoryBarrier {
    /// Makes transfer writes visible to subsequent transfer reads
    pub const TRANSFER_WRITE_TO_READ: MemoryBarrier = MemoryBarrier {
        src_stage_mask: PipelineStage::TRANSFER,
        src_access_mask: AccessFlags::TRANSFER_WRITE,
        dst_stage_mask: PipelineStage::TRANSFER,
        dst_access_mask: AccessFlags::TRANSFER_READ,
    };
}

#[cfg(feature = "vulkan")]
impl From<AccessFlags> for vk::AccessFlags2 {
    fn from(value: AccessFlags) -> Self {
        let mut flags = vk::AccessFlags2::empty();
        for (access, vk_access) in [
            (AccessFlags::TRANSFER_READ, vk::AccessFlags2::TRANSFER_READ),
            (AccessFlags::TRANSFER_WRITE, vk::AccessFlags2::TRANSFER_WRITE),
            (AccessFlags::HOST_WRITE, vk::AccessFlags2::HOST_WRITE),
            (AccessFlags::MEMORY_READ, vk::AccessFlags2::MEMORY_READ),
            (AccessFlags::MEMORY_WRITE, vk::AccessFlags2::MEMORY_WRITE),
        ] {
            if value.contains(access) {
                flags |= vk_access;
            }
        }
        flags
    }
}

#[cfg(feature = "vulkan")]
impl From<PipelineStage> for vk::PipelineStageFlags2 {
    fn from(value: PipelineStage) -> Self {
        let mut flags = vk::PipelineStageFlags2::empty();
        for (stage, vk_stage) in [
            (PipelineStage::TOP_OF_PIPE, vk::PipelineStageFlags2::TOP_OF_PIPE),
            (PipelineStage::HOST, vk::PipelineStageFlags2::HOST),
            (PipelineStage::TRANSFER, vk::PipelineStageFlags2::TRANSFER),
            (PipelineStage::ALL_COMMANDS, vk::PipelineStageFlags2::ALL_COMMANDS),
            (PipelineStage::BOTTOM_OF_PIPE, vk::PipelineStageFlags2::BOTTOM_OF_PIPE),
        ] {
            if value.contains(stage) {
                flags |= vk_stage;
            }
        }
        flags
    }
}

#[cfg(feature = "vulkan")]
impl From<&MemoryBarrier> for vk::MemoryBarrier2<'static> {
    fn from(value: &MemoryBarrier) -> Self {
        vk::MemoryBarrier2::default()
            .src_stage_mask(value.src_stage_mask.into())
            .src_access_mask(value.src_access_mask.into())
            .dst_stage_mask(value.dst_stage_mask.into())
            .dst_access_mask(value.dst_access_mask.into())
    }
}
