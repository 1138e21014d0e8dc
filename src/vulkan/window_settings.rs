use ash::vk;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl PresentMode {
    /// Picks `self` if the surface supports it. FIFO is always available.
    pub fn select(self, supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        let wanted = vk::PresentModeKHR::from(self);
        if supported.contains(&wanted) {
            wanted
        } else {
            log::warn!("Present mode {:?} is not supported, using FIFO", self);
            vk::PresentModeKHR::FIFO
        }
    }
}

impl From<PresentMode> for vk::PresentModeKHR {
    fn from(mode: PresentMode) -> Self {
        match mode {
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_fifo() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            PresentMode::Mailbox.select(&supported),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            PresentMode::Immediate.select(&supported),
            vk::PresentModeKHR::IMMEDIATE
        );
    }
}
