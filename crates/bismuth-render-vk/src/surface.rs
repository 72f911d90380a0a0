// SPDX-License-Identifier: CEPL-1.0
//! Surface policy: format, present mode, extent and image count choices.

use ash::vk;
use bismuth_render::RenderSize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VkVsyncMode {
    #[default]
    Fifo, // Target monitor refresh rate
    Mailbox, // Smart Vsync, fps uncapped
}

pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VkVsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, VkVsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, VkVsyncMode::Fifo) => &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    };
    // FIFO is the only mode every implementation has to support.
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Eight-bit sRGB-encoded formats, best first. `None` accepts any color space.
const PREFERRED_FORMATS: [(vk::Format, Option<vk::ColorSpaceKHR>); 3] = [
    (vk::Format::B8G8R8A8_SRGB, None),
    (vk::Format::R8G8B8A8_SRGB, None),
    (vk::Format::B8G8R8A8_UNORM, Some(vk::ColorSpaceKHR::SRGB_NONLINEAR)),
];

/// How a surface format was chosen, for the swapchain log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FormatPick {
    /// Rank in the preference list.
    Preferred(usize),
    DriverFirst,
}

/// `None` only when the surface reports no formats at all.
pub(crate) fn pick_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<(vk::SurfaceFormatKHR, FormatPick)> {
    PREFERRED_FORMATS
        .iter()
        .enumerate()
        .find_map(|(rank, &(format, space))| {
            formats
                .iter()
                .find(|f| f.format == format && space.map_or(true, |cs| cs == f.color_space))
                .map(|&f| (f, FormatPick::Preferred(rank)))
        })
        .or_else(|| formats.first().map(|&f| (f, FormatPick::DriverFirst)))
}

/// The surface dictates its size unless it reports the `u32::MAX` wildcard,
/// in which case the window size is clamped into the allowed range.
pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let (lo, hi) = (caps.min_image_extent, caps.max_image_extent);
    vk::Extent2D {
        width: want.width.clamp(lo.width, hi.width),
        height: want.height.clamp(lo.height, hi.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

pub(crate) fn pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}
