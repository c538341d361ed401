//! Fixed-format text rendering of resolved frames.

use crate::symbols::ResolvedFrame;

// "0x" plus two hex digits per byte, zero padded to pointer width.
const ADDRESS_WIDTH: usize = 2 + 2 * std::mem::size_of::<usize>();

/// Renders one line per frame, in capture order (innermost first).
pub fn format_frames(frames: &[ResolvedFrame]) -> Vec<String> {
    frames
        .iter()
        .enumerate()
        .map(|(index, frame)| format_frame(index, frame))
        .collect()
}

fn format_frame(index: usize, frame: &ResolvedFrame) -> String {
    match &frame.symbol {
        Some(symbol) => format!(
            "{:<3} {:#0width$x} {} + {}",
            index,
            frame.address,
            symbol,
            frame.offset,
            width = ADDRESS_WIDTH,
        ),
        None => format!(
            "{:<3} {:#0width$x} <unknown>",
            index,
            frame.address,
            width = ADDRESS_WIDTH,
        ),
    }
}
