//! Frame geometry negotiation.
//!
//! Defaults come from the link purpose; user hints override them. When a
//! buffer size is given it wins over a frame count, and giving both in a
//! way that disagrees is an error rather than something to coerce. DMA
//! buffers must also be whole pages, because the kernel maps them.

use chdr_core::config::LinkConfig;

use crate::error::{TransportError, TransportResult};
use crate::link::LinkParams;

/// Optional user overrides, all in bytes or frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkHints {
    pub recv_frame_size: Option<usize>,
    pub send_frame_size: Option<usize>,
    pub num_recv_frames: Option<usize>,
    pub num_send_frames: Option<usize>,
    pub recv_buff_size: Option<usize>,
    pub send_buff_size: Option<usize>,
}

impl From<&LinkConfig> for LinkHints {
    fn from(cfg: &LinkConfig) -> Self {
        Self {
            recv_frame_size: cfg.recv_frame_size,
            send_frame_size: cfg.send_frame_size,
            num_recv_frames: cfg.num_recv_frames,
            num_send_frames: cfg.num_send_frames,
            recv_buff_size: cfg.recv_buff_size,
            send_buff_size: cfg.send_buff_size,
        }
    }
}

/// Host page size, or 4096 when the OS will not say.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

struct Direction {
    name: &'static str,
    frame: Option<usize>,
    num: Option<usize>,
    buff: Option<usize>,
}

/// Resolve one direction to `(frame_size, num_frames)`.
fn resolve(dir: Direction, default_frame: usize, default_num: usize, page: Option<usize>) -> TransportResult<(usize, usize)> {
    let name = dir.name;
    let frame = dir.frame.unwrap_or(default_frame);
    if frame == 0 {
        return Err(TransportError::config(format!("{name}_frame_size must be non-zero")));
    }
    if dir.num == Some(0) {
        return Err(TransportError::config(format!("num_{name}_frames must be non-zero")));
    }

    if let (Some(page), Some(buff)) = (page, dir.buff) {
        if buff % page != 0 {
            return Err(TransportError::config(format!(
                "{name}_buff_size must be a multiple of {page}"
            )));
        }
    }
    if let (Some(page), Some(_), Some(num)) = (page, dir.frame, dir.num) {
        if num * frame % page != 0 {
            return Err(TransportError::config(format!(
                "num_{name}_frames * {name}_frame_size must be a multiple of {page}"
            )));
        }
    }
    if let (Some(num), Some(buff)) = (dir.num, dir.buff) {
        if buff < frame {
            return Err(TransportError::config(format!(
                "{name}_buff_size must be at least {name}_frame_size ({frame})"
            )));
        }
        if buff / frame != num {
            return Err(TransportError::config(format!(
                "conflicting {name}_buff_size ({buff}) and num_{name}_frames ({num})"
            )));
        }
    }

    let num = match (dir.buff, dir.num) {
        (Some(buff), _) => (buff / frame).max(1),
        (None, Some(num)) => num,
        (None, None) => default_num,
    };

    if let Some(page) = page {
        if num * frame % page != 0 {
            return Err(TransportError::config(format!(
                "num_{name}_frames * {name}_frame_size must be a multiple of {page}"
            )));
        }
    }
    Ok((frame, num))
}

/// Negotiate DMA link parameters. Frame sizes are also checked for 64-bit
/// alignment since the engine counts frames in words.
pub fn negotiate_dma_params(defaults: LinkParams, hints: &LinkHints, page: usize) -> TransportResult<LinkParams> {
    let (recv_frame_size, num_recv_frames) = resolve(
        Direction {
            name: "recv",
            frame: hints.recv_frame_size,
            num: hints.num_recv_frames,
            buff: hints.recv_buff_size,
        },
        defaults.recv_frame_size,
        defaults.num_recv_frames,
        Some(page),
    )?;
    let (send_frame_size, num_send_frames) = resolve(
        Direction {
            name: "send",
            frame: hints.send_frame_size,
            num: hints.num_send_frames,
            buff: hints.send_buff_size,
        },
        defaults.send_frame_size,
        defaults.num_send_frames,
        Some(page),
    )?;
    for (name, size) in [("recv", recv_frame_size), ("send", send_frame_size)] {
        if size % 8 != 0 {
            return Err(TransportError::config(format!(
                "{name}_frame_size ({size}) must be a multiple of 8"
            )));
        }
    }
    let params = LinkParams {
        recv_frame_size,
        send_frame_size,
        num_recv_frames,
        num_send_frames,
    };
    tracing::debug!(?params, page, "negotiated DMA link parameters");
    Ok(params)
}

/// Negotiate datagram link parameters. Frame sizes are clamped to the
/// measured path MTU when one is known.
pub fn negotiate_udp_params(defaults: LinkParams, hints: &LinkHints, mtu: Option<usize>) -> TransportResult<LinkParams> {
    let (mut recv_frame_size, num_recv_frames) = resolve(
        Direction {
            name: "recv",
            frame: hints.recv_frame_size,
            num: hints.num_recv_frames,
            buff: hints.recv_buff_size,
        },
        defaults.recv_frame_size,
        defaults.num_recv_frames,
        None,
    )?;
    let (mut send_frame_size, num_send_frames) = resolve(
        Direction {
            name: "send",
            frame: hints.send_frame_size,
            num: hints.num_send_frames,
            buff: hints.send_buff_size,
        },
        defaults.send_frame_size,
        defaults.num_send_frames,
        None,
    )?;

    if let Some(mtu) = mtu {
        if recv_frame_size > mtu {
            if hints.recv_frame_size.is_some() {
                tracing::warn!(requested = recv_frame_size, mtu, "recv_frame_size exceeds path MTU, clamping");
            }
            recv_frame_size = mtu;
        }
        if send_frame_size > mtu {
            if hints.send_frame_size.is_some() {
                tracing::warn!(requested = send_frame_size, mtu, "send_frame_size exceeds path MTU, clamping");
            }
            send_frame_size = mtu;
        }
    }

    let params = LinkParams {
        recv_frame_size,
        send_frame_size,
        num_recv_frames,
        num_send_frames,
    };
    tracing::debug!(?params, ?mtu, "negotiated datagram link parameters");
    Ok(params)
}
