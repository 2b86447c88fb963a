use anyhow::Result;
use ash::vk;
use derivative::Derivative;
#[allow(unused_imports)]
use tracing::trace;

use crate::traits::Destructible;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Fence {
    handle: vk::Fence,
    #[derivative(Debug = "ignore")]
    device: ash::Device,
}

impl Fence {
    pub fn new(device: ash::Device, flags: vk::FenceCreateFlags) -> Result<Self> {
        let handle = unsafe {
            device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };

        #[cfg(feature = "log-lifetimes")]
        trace!("Creating VkFence {:p}", handle);

        Ok(Self { handle, device })
    }

    pub fn get_handle(&self) -> &vk::Fence {
        &self.handle
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Non-blocking check of whether the fence has been signaled
    pub fn signaled(&self) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(self.handle)? })
    }

    /// Waits on the current fence
    pub fn wait(&self, timeout: u64) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.handle], true, timeout)?
        }
        Ok(())
    }

    /// Resets the fence
    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.handle])? }
        Ok(())
    }
}

impl Destructible for Fence {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkFence {:p}", self.handle);

        unsafe {
            self.device.destroy_fence(self.handle, None);
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.destroy();
    }
}
