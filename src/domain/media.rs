//! Container signature checks for transcoder output.

use super::jobs::OutputFormat;

/// Number of leading bytes needed by [`matches_signature`].
pub const SIGNATURE_LEN: usize = 12;

/// Cheap sanity check that `header` starts like a file of `format`.
pub fn matches_signature(format: OutputFormat, header: &[u8]) -> bool {
    match format {
        OutputFormat::Mp3 => header.starts_with(b"ID3") || is_mpeg_frame_sync(header),
        OutputFormat::M4a => is_iso_bmff(header),
        OutputFormat::Opus | OutputFormat::Ogg => header.starts_with(b"OggS"),
        OutputFormat::Flac => header.starts_with(b"fLaC"),
        OutputFormat::Wav => header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE",
    }
}

fn is_mpeg_frame_sync(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0
}

/// First box must be `ftyp` with a plausible size.
fn is_iso_bmff(header: &[u8]) -> bool {
    if header.len() < 8 {
        return false;
    }
    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    &header[4..8] == b"ftyp" && size >= 8
}
