//! Mega Drive ROM header emission.
//!
//! The console expects a fixed 256-byte header in front of the image body:
//! text fields at declared offsets/widths, big-endian memory bounds, an
//! SRAM descriptor, and a 16-bit checksum over the body that can only be
//! filled in once the linked image exists.

use thiserror::Error;

pub const HEADER_LEN: usize = 256;

const CHECKSUM_OFFSET: usize = 142;

// Documented console encoding for the SRAM type word; bit 12 marks a
// battery-backed part.
const SRAM_TYPE_PRESENT: u16 = 0xE820;
const SRAM_TYPE_BATTERY: u16 = 0x1000;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("image is shorter than the {HEADER_LEN}-byte header; no body to checksum")]
    MissingBody,
}

/// Header field values. String fields are truncated or right-padded to
/// their declared widths on emission; numbers are emitted big-endian.
#[derive(Debug, Clone)]
pub struct RomHeader {
    pub console: String,
    pub copyright: String,
    pub title_local: String,
    pub title_int: String,
    pub serial: String,
    pub io_support: String,
    pub rom_start: u32,
    pub rom_end: u32,
    pub ram_start: u32,
    pub ram_end: u32,
    pub have_sram: bool,
    pub sram_battery: bool,
    pub sram_start: u32,
    pub sram_end: u32,
    pub modem_support: String,
    pub notes: String,
    pub region: String,
}

impl Default for RomHeader {
    fn default() -> Self {
        Self {
            console: "SEGA MEGA DRIVE".to_string(),
            copyright: "(C)SOMETEAM".to_string(),
            title_local: "SAMPLE GAME".to_string(),
            title_int: "SAMPLE GAME".to_string(),
            serial: "GM 00000000-00".to_string(),
            io_support: "JD".to_string(),
            rom_start: 0,
            rom_end: 0x0010_0000,
            ram_start: 0x00FF_0000,
            ram_end: 0x00FF_FFFF,
            have_sram: false,
            sram_battery: false,
            sram_start: 0x0020_0000,
            sram_end: 0x0020_01FF,
            modem_support: String::new(),
            notes: "WRITE YOUR NOTES HERE".to_string(),
            region: "JUE".to_string(),
        }
    }
}

impl RomHeader {
    pub fn sram_type(&self) -> u16 {
        if !self.have_sram {
            return 0;
        }
        if self.sram_battery {
            SRAM_TYPE_PRESENT | SRAM_TYPE_BATTERY
        } else {
            SRAM_TYPE_PRESENT
        }
    }

    /// Emits the 256-byte header. The checksum bytes stay zero; they are
    /// patched once the image body is known.
    pub fn emit(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        put_str(&mut buf, 0, 16, &self.console, b' ');
        put_str(&mut buf, 16, 16, &self.copyright, b' ');
        put_str(&mut buf, 32, 48, &self.title_local, b' ');
        put_str(&mut buf, 80, 48, &self.title_int, b' ');
        put_str(&mut buf, 128, 14, &self.serial, b' ');
        // 142..144: checksum placeholder
        put_str(&mut buf, 144, 16, &self.io_support, 0);
        put_be32(&mut buf, 160, self.rom_start);
        put_be32(&mut buf, 164, self.rom_end);
        put_be32(&mut buf, 168, self.ram_start);
        put_be32(&mut buf, 172, self.ram_end);
        let signature: &[u8; 2] = if self.have_sram { b"RA" } else { b"  " };
        buf[176..178].copy_from_slice(signature);
        put_be16(&mut buf, 178, self.sram_type());
        put_be32(&mut buf, 180, self.sram_start);
        put_be32(&mut buf, 184, self.sram_end);
        put_str(&mut buf, 188, 12, &self.modem_support, 0);
        put_str(&mut buf, 200, 40, &self.notes, b' ');
        put_str(&mut buf, 240, 16, &self.region, b' ');
        buf
    }
}

fn put_str(buf: &mut [u8], offset: usize, width: usize, value: &str, pad: u8) {
    let bytes = value.as_bytes();
    for i in 0..width {
        buf[offset + i] = *bytes.get(i).unwrap_or(&pad);
    }
}

fn put_be32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// 16-bit wrapping sum of the body taken as big-endian byte pairs. A
/// trailing odd byte counts as the high byte of a final word.
pub fn checksum(body: &[u8]) -> u16 {
    let mut chunks = body.chunks_exact(2);
    let mut sum = 0u16;
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u16) << 8);
    }
    sum
}

/// Computes the checksum of everything past the header and patches the two
/// checksum bytes in place. The rest of the buffer is untouched.
pub fn patch_checksum(rom: &mut [u8]) -> Result<u16, HeaderError> {
    if rom.len() < HEADER_LEN {
        return Err(HeaderError::MissingBody);
    }
    let sum = checksum(&rom[HEADER_LEN..]);
    rom[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
    Ok(sum)
}

/// Header + body + patched checksum: the final ROM artifact.
pub fn assemble(header: &RomHeader, body: &[u8]) -> Vec<u8> {
    let mut rom = Vec::with_capacity(HEADER_LEN + body.len());
    rom.extend_from_slice(&header.emit());
    rom.extend_from_slice(body);
    let sum = checksum(body);
    rom[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
    rom
}
