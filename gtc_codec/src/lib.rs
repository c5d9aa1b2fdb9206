//! GTC texture codec: images stored as four tANS entropy-coded planes are
//! transcoded, in batches, into DXT1-style 4x4 blocks written directly into
//! a shared pixel buffer.
//!
//! The host side parses containers, packs pages of requests into one staging
//! buffer and drives a backend through an acquire/decode/release protocol.
//! Two backends exist: a reference CPU pipeline and a wgpu compute pipeline
//! (`gpu` module).

use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;

use gtc_ans::{
    decode_interleaved, encode_interleaved, AnsError, DecoderTable, EncoderModel,
    MAX_ALPHABET_SIZE,
};

mod gpu;
pub use gpu::WgpuBackend;

/// Fixed container header size in bytes.
pub const HEADER_BYTES: usize = 48;
/// Serialized frequency tables carry one u32 slot per symbol value 0..=511.
pub const FREQ_TABLE_ENTRIES: usize = 512;
pub const FREQ_TABLE_BYTES: usize = FREQ_TABLE_ENTRIES * 4;
/// Y, chroma, palette, indices.
pub const PLANES_PER_IMAGE: usize = 4;
/// Streams interleaved per payload. Fixed at build time; the container does
/// not record it.
pub const DEFAULT_INTERLEAVE_FACTOR: usize = 32;
/// Requests batched into one device submission.
pub const DEFAULT_PAGE_SIZE: usize = 16;
/// One 4x4 block encodes to 8 bytes.
pub const DXT_BLOCK_BYTES: usize = 8;
pub const MAX_PALETTE_ENTRIES: usize = 256;
const MAX_DIMENSION: u32 = 1 << 12;
// The offset tables at the head of a page are padded to a multiple of 128
// u32 entries before the frequency tables start.
const OFFSET_REGION_ALIGN_WORDS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GtcError {
    #[error("bad container: {0}")]
    BadContainer(&'static str),
    #[error("malformed stream: {0}")]
    MalformedStream(&'static str),
    #[error("empty histogram")]
    EmptyHistogram,
    #[error("alphabet too large: {0} symbols")]
    AlphabetTooLarge(usize),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("device unsupported: {0}")]
    DeviceUnsupported(String),
    #[error("interop failure: {0}")]
    InteropFailure(String),
    #[error("out of resources: {0}")]
    OutOfResources(String),
}

impl From<AnsError> for GtcError {
    fn from(err: AnsError) -> Self {
        match err {
            AnsError::EmptyHistogram => GtcError::EmptyHistogram,
            AnsError::AlphabetTooLarge(n) => GtcError::AlphabetTooLarge(n),
            AnsError::MalformedStream(detail) => GtcError::MalformedStream(detail),
            AnsError::ZeroFrequencySymbol(_) => {
                GtcError::MalformedStream("symbol outside the coded alphabet")
            }
            AnsError::StateOverflow => GtcError::MalformedStream("encoder state overflow"),
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

// ---------------------------------------------------------------------------
// Header and container
// ---------------------------------------------------------------------------

/// On-disk image header. All fields little-endian; 48 bytes total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    /// Byte length of the palette plane after entropy decoding.
    pub palette_bytes: u64,
    pub y_cmp_sz: u64,
    pub chroma_cmp_sz: u64,
    pub palette_sz: u64,
    pub indices_sz: u64,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, GtcError> {
    let end = offset
        .checked_add(4)
        .ok_or(GtcError::BadContainer("u32 offset overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(GtcError::BadContainer("u32 out of range"))?;
    let array: [u8; 4] = slice
        .try_into()
        .map_err(|_| GtcError::BadContainer("u32 parse failed"))?;
    Ok(u32::from_le_bytes(array))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, GtcError> {
    let end = offset
        .checked_add(8)
        .ok_or(GtcError::BadContainer("u64 offset overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(GtcError::BadContainer("u64 out of range"))?;
    let array: [u8; 8] = slice
        .try_into()
        .map_err(|_| GtcError::BadContainer("u64 parse failed"))?;
    Ok(u64::from_le_bytes(array))
}

fn write_u32_at(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, GtcError> {
        if bytes.len() < HEADER_BYTES {
            return Err(GtcError::BadContainer("container shorter than header"));
        }
        let header = Self {
            width: read_u32(bytes, 0)?,
            height: read_u32(bytes, 4)?,
            palette_bytes: read_u64(bytes, 8)?,
            y_cmp_sz: read_u64(bytes, 16)?,
            chroma_cmp_sz: read_u64(bytes, 24)?,
            palette_sz: read_u64(bytes, 32)?,
            indices_sz: read_u64(bytes, 40)?,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.palette_bytes.to_le_bytes());
        out.extend_from_slice(&self.y_cmp_sz.to_le_bytes());
        out.extend_from_slice(&self.chroma_cmp_sz.to_le_bytes());
        out.extend_from_slice(&self.palette_sz.to_le_bytes());
        out.extend_from_slice(&self.indices_sz.to_le_bytes());
    }

    pub fn validate(&self) -> Result<(), GtcError> {
        if self.width == 0 || self.height == 0 {
            return Err(GtcError::BadContainer("zero image dimension"));
        }
        if self.width % 4 != 0 || self.height % 4 != 0 {
            return Err(GtcError::BadContainer("dimensions not multiples of 4"));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(GtcError::BadContainer("dimensions too large"));
        }
        if self.palette_bytes == 0 || self.palette_bytes % 4 != 0 {
            return Err(GtcError::BadContainer("palette byte count not a multiple of 4"));
        }
        if self.palette_bytes > (MAX_PALETTE_ENTRIES * 4) as u64 {
            return Err(GtcError::BadContainer("palette too large"));
        }
        if self.y_cmp_sz == 0
            || self.chroma_cmp_sz == 0
            || self.palette_sz == 0
            || self.indices_sz == 0
        {
            return Err(GtcError::BadContainer("zero payload size"));
        }
        let size_cap = 1u64 << 31;
        if self.y_cmp_sz >= size_cap
            || self.chroma_cmp_sz >= size_cap
            || self.palette_sz >= size_cap
            || self.indices_sz >= size_cap
        {
            return Err(GtcError::BadContainer("payload size out of range"));
        }
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        (self.width as usize * self.height as usize) / 16
    }

    pub fn dxt_bytes(&self) -> usize {
        self.block_count() * DXT_BLOCK_BYTES
    }

    pub fn rgb_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Decoded symbol count of each plane, in container order.
    pub fn plane_symbol_counts(&self) -> [usize; PLANES_PER_IMAGE] {
        let blocks = self.block_count();
        [
            2 * blocks,
            4 * blocks,
            self.palette_bytes as usize,
            blocks,
        ]
    }

    /// Entropy-coded byte length of each payload, in container order.
    pub fn payload_sizes(&self) -> [usize; PLANES_PER_IMAGE] {
        [
            self.y_cmp_sz as usize,
            self.chroma_cmp_sz as usize,
            self.palette_sz as usize,
            self.indices_sz as usize,
        ]
    }

    /// Total container size implied by the header.
    pub fn container_bytes(&self) -> usize {
        HEADER_BYTES
            + self
                .payload_sizes()
                .iter()
                .map(|sz| FREQ_TABLE_BYTES + sz)
                .sum::<usize>()
    }

    /// Device scratch needed for the decoded planes of one image.
    pub fn scratch_bytes(&self) -> usize {
        self.plane_symbol_counts().iter().sum()
    }

    pub fn output_bytes(&self, output: OutputKind) -> usize {
        match output {
            OutputKind::Dxt => self.dxt_bytes(),
            OutputKind::Rgb => self.rgb_bytes(),
        }
    }
}

/// The four decoded planes of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneSet {
    /// Endpoint luma, planar: `block_count` bytes of y0 then y1.
    pub y: Vec<u8>,
    /// Endpoint chroma, planar: co0, cg0, co1, cg1, biased by +128.
    pub chroma: Vec<u8>,
    /// Little-endian u32 selector words, up to 256 entries.
    pub palette: Vec<u8>,
    /// One palette index byte per block.
    pub indices: Vec<u8>,
}

impl PlaneSet {
    fn validate(&self, width: u32, height: u32) -> Result<(), GtcError> {
        let blocks = (width as usize * height as usize) / 16;
        if self.y.len() != 2 * blocks
            || self.chroma.len() != 4 * blocks
            || self.indices.len() != blocks
        {
            return Err(GtcError::BadContainer("plane sizes disagree with dimensions"));
        }
        if self.palette.is_empty()
            || self.palette.len() % 4 != 0
            || self.palette.len() > MAX_PALETTE_ENTRIES * 4
        {
            return Err(GtcError::BadContainer("palette plane size invalid"));
        }
        Ok(())
    }
}

/// Shape of the transcoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// 8 bytes per 4x4 block, bindable as a compressed texture.
    Dxt,
    /// 3 bytes per pixel.
    Rgb,
}

fn rank_lengths(total: usize, interleave: usize) -> Vec<usize> {
    (0..interleave)
        .map(|rank| {
            if rank < total {
                (total - rank).div_ceil(interleave)
            } else {
                0
            }
        })
        .collect()
}

fn split_strided(plane: &[u8], interleave: usize) -> Vec<Vec<u8>> {
    let mut ranks: Vec<Vec<u8>> = rank_lengths(plane.len(), interleave)
        .into_iter()
        .map(Vec::with_capacity)
        .collect();
    for (position, &symbol) in plane.iter().enumerate() {
        ranks[position % interleave].push(symbol);
    }
    ranks
}

fn merge_strided(ranks: &[Vec<u8>], total: usize) -> Vec<u8> {
    let interleave = ranks.len();
    let mut plane = vec![0u8; total];
    for (position, slot) in plane.iter_mut().enumerate() {
        *slot = ranks[position % interleave][position / interleave];
    }
    plane
}

fn serialize_freq_table(normalized: &[u32], out: &mut Vec<u8>) {
    debug_assert!(normalized.len() <= MAX_ALPHABET_SIZE);
    for &freq in normalized {
        out.extend_from_slice(&freq.to_le_bytes());
    }
    for _ in normalized.len()..FREQ_TABLE_ENTRIES {
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

fn parse_freq_table(bytes: &[u8]) -> Result<Vec<u32>, GtcError> {
    if bytes.len() != FREQ_TABLE_BYTES {
        return Err(GtcError::BadContainer("frequency table truncated"));
    }
    let mut counts = Vec::with_capacity(MAX_ALPHABET_SIZE);
    for entry in 0..FREQ_TABLE_ENTRIES {
        let count = read_u32(bytes, entry * 4)?;
        if entry < MAX_ALPHABET_SIZE {
            counts.push(count);
        } else if count != 0 {
            // Symbols are single bytes end to end; the upper slots exist
            // only to keep the serialized table shape.
            return Err(GtcError::AlphabetTooLarge(entry + 1));
        }
    }
    Ok(counts)
}

fn encode_payload(
    plane: &[u8],
    interleave: usize,
    table_out: &mut Vec<u8>,
    payload_out: &mut Vec<u8>,
) -> Result<(), GtcError> {
    let mut histogram = vec![0u32; MAX_ALPHABET_SIZE];
    for &symbol in plane {
        histogram[usize::from(symbol)] += 1;
    }
    let model = EncoderModel::new(&histogram)?;
    serialize_freq_table(model.normalized_frequencies(), table_out);

    let ranks = split_strided(plane, interleave);
    let refs: Vec<&[u8]> = ranks.iter().map(|rank| rank.as_slice()).collect();
    let encoded = encode_interleaved(&refs, &model)?;
    for &state in &encoded.states {
        payload_out.extend_from_slice(&state.to_le_bytes());
    }
    payload_out.extend_from_slice(&encoded.bytes);
    Ok(())
}

fn decode_payload(
    table_bytes: &[u8],
    payload: &[u8],
    total_symbols: usize,
    interleave: usize,
) -> Result<Vec<u8>, GtcError> {
    let counts = parse_freq_table(table_bytes)?;
    let table = DecoderTable::new(&counts)?;

    let states_bytes = interleave * 4;
    if payload.len() < states_bytes {
        return Err(GtcError::BadContainer("payload too small for stream states"));
    }
    let mut states = Vec::with_capacity(interleave);
    for rank in 0..interleave {
        states.push(read_u32(payload, rank * 4)?);
    }
    let stream = &payload[states_bytes..];
    let lens = rank_lengths(total_symbols, interleave);
    let ranks = decode_interleaved(stream, &states, &lens, &table)?;
    Ok(merge_strided(&ranks, total_symbols))
}

/// Serialize four planes into a GTC container.
pub fn encode_planes(
    planes: &PlaneSet,
    width: u32,
    height: u32,
    interleave: usize,
) -> Result<Vec<u8>, GtcError> {
    if width == 0 || height == 0 || width % 4 != 0 || height % 4 != 0 {
        return Err(GtcError::BadContainer("dimensions not multiples of 4"));
    }
    planes.validate(width, height)?;
    if interleave == 0 || interleave > 64 {
        return Err(GtcError::InvalidOptions("interleave factor out of range"));
    }

    let plane_refs: [&[u8]; PLANES_PER_IMAGE] =
        [&planes.y, &planes.chroma, &planes.palette, &planes.indices];
    let mut tables: Vec<Vec<u8>> = Vec::with_capacity(PLANES_PER_IMAGE);
    let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(PLANES_PER_IMAGE);
    for plane in plane_refs {
        let mut table = Vec::with_capacity(FREQ_TABLE_BYTES);
        let mut payload = Vec::new();
        encode_payload(plane, interleave, &mut table, &mut payload)?;
        tables.push(table);
        payloads.push(payload);
    }

    let header = ImageHeader {
        width,
        height,
        palette_bytes: planes.palette.len() as u64,
        y_cmp_sz: payloads[0].len() as u64,
        chroma_cmp_sz: payloads[1].len() as u64,
        palette_sz: payloads[2].len() as u64,
        indices_sz: payloads[3].len() as u64,
    };

    let mut out = Vec::with_capacity(header.container_bytes());
    header.write_to(&mut out);
    for (table, payload) in tables.iter().zip(payloads.iter()) {
        out.extend_from_slice(table);
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// Byte spans of the four `(frequency table, payload)` sections.
fn section_spans(header: &ImageHeader) -> [(Range<usize>, Range<usize>); PLANES_PER_IMAGE] {
    let mut cursor = HEADER_BYTES;
    let sizes = header.payload_sizes();
    std::array::from_fn(|plane| {
        let table = cursor..cursor + FREQ_TABLE_BYTES;
        let payload = table.end..table.end + sizes[plane];
        cursor = payload.end;
        (table, payload)
    })
}

/// Parse a container and entropy-decode all four planes on the host.
pub fn decode_container(
    bytes: &[u8],
    interleave: usize,
) -> Result<(ImageHeader, PlaneSet), GtcError> {
    let header = ImageHeader::parse(bytes)?;
    if header.container_bytes() != bytes.len() {
        return Err(GtcError::BadContainer("payload sizes disagree with container length"));
    }
    let spans = section_spans(&header);
    let counts = header.plane_symbol_counts();
    let mut planes: Vec<Vec<u8>> = Vec::with_capacity(PLANES_PER_IMAGE);
    for (plane, (table, payload)) in spans.iter().enumerate() {
        planes.push(decode_payload(
            &bytes[table.clone()],
            &bytes[payload.clone()],
            counts[plane],
            interleave,
        )?);
    }
    let indices = planes.pop().unwrap_or_default();
    let palette = planes.pop().unwrap_or_default();
    let chroma = planes.pop().unwrap_or_default();
    let y = planes.pop().unwrap_or_default();
    Ok((
        header,
        PlaneSet {
            y,
            chroma,
            palette,
            indices,
        },
    ))
}

// ---------------------------------------------------------------------------
// Block reconstruction
// ---------------------------------------------------------------------------

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Inverse YCoCg with +128 chroma bias, packed to RGB565.
fn ycocg_to_rgb565(y: u8, co: u8, cg: u8) -> u16 {
    let y = i32::from(y);
    let co = i32::from(co) - 128;
    let cg = i32::from(cg) - 128;
    let r = clamp_u8(y + co - cg);
    let g = clamp_u8(y + cg);
    let b = clamp_u8(y - co - cg);
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

fn rgb565_to_rgb(color: u16) -> [u8; 3] {
    let r = ((color >> 11) & 0x1f) as u32;
    let g = ((color >> 5) & 0x3f) as u32;
    let b = (color & 0x1f) as u32;
    [
        ((r * 255 + 15) / 31) as u8,
        ((g * 255 + 31) / 63) as u8,
        ((b * 255 + 15) / 31) as u8,
    ]
}

/// Assemble DXT blocks from decoded planes. `out` must hold
/// `header.dxt_bytes()`.
pub fn reconstruct_blocks(
    header: &ImageHeader,
    planes: &PlaneSet,
    out: &mut [u8],
) -> Result<(), GtcError> {
    planes.validate(header.width, header.height)?;
    let blocks = header.block_count();
    if out.len() != header.dxt_bytes() {
        return Err(GtcError::BadContainer("output span size mismatch"));
    }
    let palette_entries = planes.palette.len() / 4;
    for block in 0..blocks {
        let c0 = ycocg_to_rgb565(
            planes.y[block],
            planes.chroma[block],
            planes.chroma[blocks + block],
        );
        let c1 = ycocg_to_rgb565(
            planes.y[blocks + block],
            planes.chroma[2 * blocks + block],
            planes.chroma[3 * blocks + block],
        );
        let index = usize::from(planes.indices[block]);
        if index >= palette_entries {
            return Err(GtcError::MalformedStream("palette index out of range"));
        }
        let selector = read_u32(&planes.palette, index * 4)
            .map_err(|_| GtcError::MalformedStream("palette entry out of range"))?;
        let base = block * DXT_BLOCK_BYTES;
        out[base..base + 2].copy_from_slice(&c0.to_le_bytes());
        out[base + 2..base + 4].copy_from_slice(&c1.to_le_bytes());
        out[base + 4..base + 8].copy_from_slice(&selector.to_le_bytes());
    }
    Ok(())
}

/// Expand assembled DXT blocks to tightly packed RGB bytes (3 per pixel).
pub fn expand_blocks_to_rgb(header: &ImageHeader, dxt: &[u8], out: &mut [u8]) -> Result<(), GtcError> {
    if dxt.len() != header.dxt_bytes() || out.len() != header.rgb_bytes() {
        return Err(GtcError::BadContainer("output span size mismatch"));
    }
    let width = header.width as usize;
    let blocks_x = width / 4;
    for (block, chunk) in dxt.chunks_exact(DXT_BLOCK_BYTES).enumerate() {
        let c0 = u16::from_le_bytes([chunk[0], chunk[1]]);
        let c1 = u16::from_le_bytes([chunk[2], chunk[3]]);
        let selector = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        let rgb0 = rgb565_to_rgb(c0);
        let rgb1 = rgb565_to_rgb(c1);
        let mut colors = [[0u8; 3]; 4];
        colors[0] = rgb0;
        colors[1] = rgb1;
        for channel in 0..3 {
            let a = u32::from(rgb0[channel]);
            let b = u32::from(rgb1[channel]);
            colors[2][channel] = ((2 * a + b) / 3) as u8;
            colors[3][channel] = ((a + 2 * b) / 3) as u8;
        }
        let bx = block % blocks_x;
        let by = block / blocks_x;
        for py in 0..4 {
            for px in 0..4 {
                let code = ((selector >> (2 * (py * 4 + px))) & 0x3) as usize;
                let pixel = (by * 4 + py) * width + bx * 4 + px;
                out[pixel * 3..pixel * 3 + 3].copy_from_slice(&colors[code]);
            }
        }
    }
    Ok(())
}

/// Derive a plane set from raw RGB input (3 bytes per pixel). This is the
/// lightweight encoder used by the demo and tests: endpoints come from the
/// per-block luma extremes and selector words are palettized by exact match
/// with a nearest-entry fallback once the palette is full.
pub fn planes_from_rgb(width: u32, height: u32, rgb: &[u8]) -> Result<PlaneSet, GtcError> {
    if width == 0 || height == 0 || width % 4 != 0 || height % 4 != 0 {
        return Err(GtcError::BadContainer("dimensions not multiples of 4"));
    }
    let (width_px, height_px) = (width as usize, height as usize);
    if rgb.len() != width_px * height_px * 3 {
        return Err(GtcError::BadContainer("rgb input size mismatch"));
    }

    let blocks_x = width_px / 4;
    let blocks = blocks_x * (height_px / 4);
    let mut y0_plane = vec![0u8; blocks];
    let mut y1_plane = vec![0u8; blocks];
    let mut chroma = vec![0u8; 4 * blocks];
    let mut palette: Vec<u32> = Vec::new();
    let mut indices = vec![0u8; blocks];

    for block in 0..blocks {
        let bx = block % blocks_x;
        let by = block / blocks_x;
        let mut luma = [0i32; 16];
        let mut co = [0i32; 16];
        let mut cg = [0i32; 16];
        for py in 0..4 {
            for px in 0..4 {
                let pixel = (by * 4 + py) * width_px + bx * 4 + px;
                let r = i32::from(rgb[pixel * 3]);
                let g = i32::from(rgb[pixel * 3 + 1]);
                let b = i32::from(rgb[pixel * 3 + 2]);
                let texel = py * 4 + px;
                luma[texel] = (r + 2 * g + b) / 4;
                co[texel] = (r - b) / 2;
                cg[texel] = g - (r + 2 * g + b) / 4;
            }
        }

        let mut hi = 0usize;
        let mut lo = 0usize;
        for texel in 1..16 {
            if luma[texel] > luma[hi] {
                hi = texel;
            }
            if luma[texel] < luma[lo] {
                lo = texel;
            }
        }

        let mut e0 = (luma[hi], co[hi], cg[hi]);
        let mut e1 = (luma[lo], co[lo], cg[lo]);
        let mut c0 = ycocg_to_rgb565(
            clamp_u8(e0.0),
            clamp_u8(e0.1 + 128),
            clamp_u8(e0.2 + 128),
        );
        let mut c1 = ycocg_to_rgb565(
            clamp_u8(e1.0),
            clamp_u8(e1.1 + 128),
            clamp_u8(e1.2 + 128),
        );
        if c0 < c1 {
            std::mem::swap(&mut e0, &mut e1);
            std::mem::swap(&mut c0, &mut c1);
        }

        // Selector codes are chosen against the final endpoint order, so a
        // swap above needs no code remapping.
        let mut selector = 0u32;
        if c0 != c1 {
            let span = (e0.0 - e1.0).max(1);
            for texel in 0..16 {
                let ratio = ((luma[texel] - e1.0) * 6) / span;
                let code: u32 = if ratio >= 5 {
                    0
                } else if ratio >= 3 {
                    2
                } else if ratio >= 1 {
                    3
                } else {
                    1
                };
                selector |= code << (2 * texel);
            }
        }

        y0_plane[block] = clamp_u8(e0.0);
        y1_plane[block] = clamp_u8(e1.0);
        chroma[block] = clamp_u8(e0.1 + 128);
        chroma[blocks + block] = clamp_u8(e0.2 + 128);
        chroma[2 * blocks + block] = clamp_u8(e1.1 + 128);
        chroma[3 * blocks + block] = clamp_u8(e1.2 + 128);

        let index = match palette.iter().position(|&word| word == selector) {
            Some(found) => found,
            None if palette.len() < MAX_PALETTE_ENTRIES => {
                palette.push(selector);
                palette.len() - 1
            }
            None => {
                // Palette is full: fall back to the closest existing word.
                palette
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, &word)| (word ^ selector).count_ones())
                    .map(|(found, _)| found)
                    .unwrap_or(0)
            }
        };
        indices[block] = index as u8;
    }

    let mut y = y0_plane;
    y.extend_from_slice(&y1_plane);
    let mut palette_bytes = Vec::with_capacity(palette.len() * 4);
    for word in palette {
        palette_bytes.extend_from_slice(&word.to_le_bytes());
    }
    Ok(PlaneSet {
        y,
        chroma,
        palette: palette_bytes,
        indices,
    })
}

// ---------------------------------------------------------------------------
// Events and the shared pixel buffer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventInner {
    done: Mutex<bool>,
    cv: Condvar,
}

/// A monotonic completion event. User events start unsignaled and are
/// signaled exactly once by their creator; backend events are signaled when
/// the associated work finishes.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaled() -> Self {
        let event = Self::new();
        event.signal();
        event
    }

    pub fn signal(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.inner.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.inner.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait_all(events: &[Event]) {
        for event in events {
            event.wait();
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

pub(crate) enum PixelStorage {
    Host(Arc<Mutex<Vec<u8>>>),
    Device(gpu::GpuPixelStorage),
}

/// Destination buffer shared between the caller and the accelerator. It must
/// be acquired before any write and released before the caller touches the
/// result.
pub struct PixelBuffer {
    len: usize,
    acquired: Mutex<bool>,
    pub(crate) storage: PixelStorage,
}

impl PixelBuffer {
    pub(crate) fn new(len: usize, storage: PixelStorage) -> Self {
        Self {
            len,
            acquired: Mutex::new(false),
            storage,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn try_mark_acquired(&self) -> Result<(), GtcError> {
        let mut acquired = self.acquired.lock().unwrap_or_else(|e| e.into_inner());
        if *acquired {
            return Err(GtcError::InteropFailure(
                "pixel buffer already acquired".to_string(),
            ));
        }
        *acquired = true;
        Ok(())
    }

    fn mark_released(&self) -> Result<(), GtcError> {
        let mut acquired = self.acquired.lock().unwrap_or_else(|e| e.into_inner());
        if !*acquired {
            return Err(GtcError::InteropFailure(
                "pixel buffer released without acquire".to_string(),
            ));
        }
        *acquired = false;
        Ok(())
    }

}

// ---------------------------------------------------------------------------
// Backend abstraction
// ---------------------------------------------------------------------------

/// One page of requests handed to a backend. The staging buffer holds the
/// packed page region (offset tables, frequency tables, payloads); output
/// goes to the shared pixel buffer at the per-request offsets.
pub struct PageSubmission {
    pub headers: Vec<ImageHeader>,
    pub staging: Arc<Vec<u8>>,
    pub page_range: Range<usize>,
    pub dst_offsets: Vec<usize>,
    pub output: OutputKind,
    pub interleave: usize,
}

/// Handle for an in-flight page. `results` is fully populated before
/// `event` signals.
pub struct PageTicket {
    pub event: Event,
    pub results: Arc<Mutex<Vec<Option<GtcError>>>>,
}

/// The accelerator seam: enqueue-copy and enqueue-kernel collapse into
/// `decode_page`; acquire/release guard the shared pixel buffer; events
/// express ordering.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe required device features. `DeviceUnsupported` when absent.
    fn check_features(&self) -> Result<(), GtcError>;

    fn base_address_alignment(&self) -> usize;

    fn preallocate_scratch(&self, bytes: usize) -> Result<(), GtcError>;

    fn free_scratch(&self);

    fn create_pixel_buffer(&self, bytes: usize) -> Result<PixelBuffer, GtcError>;

    /// Copy the pixel buffer back to host memory. Only valid while the
    /// buffer is not acquired by the accelerator.
    fn read_pixels(&self, pixels: &PixelBuffer) -> Result<Vec<u8>, GtcError>;

    fn acquire_shared(&self, pixels: &PixelBuffer, wait: &[Event]) -> Result<Event, GtcError>;

    fn release_shared(&self, pixels: &PixelBuffer, wait: &[Event]) -> Result<Event, GtcError>;

    /// Launch the decode pipeline for one page. The returned event fires
    /// after every output byte of the page is visible in the pixel buffer.
    fn decode_page(
        &self,
        page: PageSubmission,
        pixels: &PixelBuffer,
        wait: &[Event],
    ) -> Result<PageTicket, GtcError>;
}

// Page staging layout, shared by the scheduler and both backends:
//   [4K u32 output offsets][4K u32 input offsets][pad to 128-word multiple]
//   [K * 4 * 2048 bytes of frequency tables]
//   [concatenated payloads]

pub(crate) fn page_offsets_region_bytes(request_count: usize) -> usize {
    let words = 2 * PLANES_PER_IMAGE * request_count;
    words.div_ceil(OFFSET_REGION_ALIGN_WORDS) * OFFSET_REGION_ALIGN_WORDS * 4
}

pub(crate) fn page_staging_bytes(headers: &[ImageHeader]) -> usize {
    let payloads: usize = headers
        .iter()
        .map(|hdr| hdr.payload_sizes().iter().sum::<usize>())
        .sum();
    page_offsets_region_bytes(headers.len())
        + headers.len() * PLANES_PER_IMAGE * FREQ_TABLE_BYTES
        + payloads
}

/// Per-request view into a staged page: one `(table, payload)` slice pair
/// per plane.
pub(crate) struct RequestView<'a> {
    pub tables: [&'a [u8]; PLANES_PER_IMAGE],
    pub payloads: [&'a [u8]; PLANES_PER_IMAGE],
}

pub(crate) fn page_request_views<'a>(
    staging: &'a [u8],
    headers: &[ImageHeader],
) -> Result<Vec<RequestView<'a>>, GtcError> {
    let freq_base = page_offsets_region_bytes(headers.len());
    let payload_base = freq_base + headers.len() * PLANES_PER_IMAGE * FREQ_TABLE_BYTES;
    let mut payload_cursor = payload_base;
    let mut views = Vec::with_capacity(headers.len());
    for (request, header) in headers.iter().enumerate() {
        let table_base = freq_base + request * PLANES_PER_IMAGE * FREQ_TABLE_BYTES;
        let sizes = header.payload_sizes();
        let mut tables: [&[u8]; PLANES_PER_IMAGE] = [&[]; PLANES_PER_IMAGE];
        let mut payloads: [&[u8]; PLANES_PER_IMAGE] = [&[]; PLANES_PER_IMAGE];
        for plane in 0..PLANES_PER_IMAGE {
            let table_off = table_base + plane * FREQ_TABLE_BYTES;
            tables[plane] = staging
                .get(table_off..table_off + FREQ_TABLE_BYTES)
                .ok_or(GtcError::BadContainer("staged table out of range"))?;
            payloads[plane] = staging
                .get(payload_cursor..payload_cursor + sizes[plane])
                .ok_or(GtcError::BadContainer("staged payload out of range"))?;
            payload_cursor += sizes[plane];
        }
        views.push(RequestView { tables, payloads });
    }
    Ok(views)
}

fn fill_page_staging(chunk: &mut [u8], requests: &[(&ImageHeader, &[u8])]) {
    let request_count = requests.len();
    let freq_base = page_offsets_region_bytes(request_count);
    let payload_base = freq_base + request_count * PLANES_PER_IMAGE * FREQ_TABLE_BYTES;

    let mut output_offset = 0u32;
    let mut input_offset = 0u32;
    let mut freq_cursor = freq_base;
    let mut payload_cursor = payload_base;
    for (request, (header, container)) in requests.iter().enumerate() {
        let spans = section_spans(header);
        let symbol_counts = header.plane_symbol_counts();
        for (plane, (table, payload)) in spans.iter().enumerate() {
            // Output offsets first, then input offsets, both 4 per request.
            let slot = (request * PLANES_PER_IMAGE + plane) * 4;
            write_u32_at(chunk, slot, output_offset);
            write_u32_at(
                chunk,
                request_count * PLANES_PER_IMAGE * 4 + slot,
                input_offset,
            );
            output_offset += symbol_counts[plane] as u32;
            input_offset += payload.len() as u32;

            chunk[freq_cursor..freq_cursor + FREQ_TABLE_BYTES]
                .copy_from_slice(&container[table.clone()]);
            freq_cursor += FREQ_TABLE_BYTES;
            chunk[payload_cursor..payload_cursor + payload.len()]
                .copy_from_slice(&container[payload.clone()]);
            payload_cursor += payload.len();
        }
    }
}

/// Decode one staged request back to its plane set. Shared between the CPU
/// backend and the wgpu backend's validation path.
pub(crate) fn decode_request_planes(
    view: &RequestView<'_>,
    header: &ImageHeader,
    interleave: usize,
) -> Result<PlaneSet, GtcError> {
    let counts = header.plane_symbol_counts();
    let y = decode_payload(view.tables[0], view.payloads[0], counts[0], interleave)?;
    let chroma = decode_payload(view.tables[1], view.payloads[1], counts[1], interleave)?;
    let palette = decode_payload(view.tables[2], view.payloads[2], counts[2], interleave)?;
    let indices = decode_payload(view.tables[3], view.payloads[3], counts[3], interleave)?;
    Ok(PlaneSet {
        y,
        chroma,
        palette,
        indices,
    })
}

fn transcode_request(
    view: &RequestView<'_>,
    header: &ImageHeader,
    interleave: usize,
    output: OutputKind,
) -> Result<Vec<u8>, GtcError> {
    let planes = decode_request_planes(view, header, interleave)?;
    let mut dxt = vec![0u8; header.dxt_bytes()];
    reconstruct_blocks(header, &planes, &mut dxt)?;
    match output {
        OutputKind::Dxt => Ok(dxt),
        OutputKind::Rgb => {
            let mut rgb = vec![0u8; header.rgb_bytes()];
            expand_blocks_to_rgb(header, &dxt, &mut rgb)?;
            Ok(rgb)
        }
    }
}

// ---------------------------------------------------------------------------
// CPU reference backend
// ---------------------------------------------------------------------------

/// Host-side reference implementation of the decode pipeline. Deterministic
/// and always available; the wgpu backend must match it byte for byte.
#[derive(Default)]
pub struct CpuBackend {
    scratch_reserved: Mutex<usize>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn check_features(&self) -> Result<(), GtcError> {
        Ok(())
    }

    fn base_address_alignment(&self) -> usize {
        4
    }

    fn preallocate_scratch(&self, bytes: usize) -> Result<(), GtcError> {
        let mut reserved = self
            .scratch_reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *reserved = (*reserved).max(bytes);
        Ok(())
    }

    fn free_scratch(&self) {
        let mut reserved = self
            .scratch_reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *reserved = 0;
    }

    fn create_pixel_buffer(&self, bytes: usize) -> Result<PixelBuffer, GtcError> {
        Ok(PixelBuffer::new(
            bytes,
            PixelStorage::Host(Arc::new(Mutex::new(vec![0u8; bytes]))),
        ))
    }

    fn read_pixels(&self, pixels: &PixelBuffer) -> Result<Vec<u8>, GtcError> {
        match &pixels.storage {
            PixelStorage::Host(data) => Ok(data.lock().unwrap_or_else(|e| e.into_inner()).clone()),
            PixelStorage::Device(_) => Err(GtcError::InteropFailure(
                "device pixel buffer handed to cpu backend".to_string(),
            )),
        }
    }

    fn acquire_shared(&self, pixels: &PixelBuffer, wait: &[Event]) -> Result<Event, GtcError> {
        pixels.try_mark_acquired()?;
        let event = Event::new();
        let signal = event.clone();
        let wait: Vec<Event> = wait.to_vec();
        std::thread::spawn(move || {
            Event::wait_all(&wait);
            signal.signal();
        });
        Ok(event)
    }

    fn release_shared(&self, pixels: &PixelBuffer, wait: &[Event]) -> Result<Event, GtcError> {
        Event::wait_all(wait);
        pixels.mark_released()?;
        Ok(Event::signaled())
    }

    fn decode_page(
        &self,
        page: PageSubmission,
        pixels: &PixelBuffer,
        wait: &[Event],
    ) -> Result<PageTicket, GtcError> {
        let data = match &pixels.storage {
            PixelStorage::Host(data) => Arc::clone(data),
            PixelStorage::Device(_) => {
                return Err(GtcError::InteropFailure(
                    "device pixel buffer handed to cpu backend".to_string(),
                ))
            }
        };
        let event = Event::new();
        let results = Arc::new(Mutex::new(vec![None; page.headers.len()]));
        let ticket = PageTicket {
            event: event.clone(),
            results: Arc::clone(&results),
        };
        let wait: Vec<Event> = wait.to_vec();
        std::thread::spawn(move || {
            Event::wait_all(&wait);
            let staging = &page.staging[page.page_range.clone()];
            let outcome = page_request_views(staging, &page.headers);
            match outcome {
                Ok(views) => {
                    for (request, view) in views.iter().enumerate() {
                        let transcoded = transcode_request(
                            view,
                            &page.headers[request],
                            page.interleave,
                            page.output,
                        );
                        match transcoded {
                            Ok(bytes) => {
                                let offset = page.dst_offsets[request];
                                let mut data = data.lock().unwrap_or_else(|e| e.into_inner());
                                data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                            }
                            Err(err) => {
                                let mut slots =
                                    results.lock().unwrap_or_else(|e| e.into_inner());
                                slots[request] = Some(err);
                            }
                        }
                    }
                }
                Err(err) => {
                    let mut slots = results.lock().unwrap_or_else(|e| e.into_inner());
                    for slot in slots.iter_mut() {
                        *slot = Some(err.clone());
                    }
                }
            }
            event.signal();
        });
        Ok(ticket)
    }
}

// ---------------------------------------------------------------------------
// Batch scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Populate staging with a worker pool instead of the calling thread.
    pub async_load: bool,
    /// Emit one-shot timing lines during flush.
    pub profiling: bool,
    pub page_size: usize,
    pub interleave_factor: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            async_load: true,
            profiling: false,
            page_size: DEFAULT_PAGE_SIZE,
            interleave_factor: DEFAULT_INTERLEAVE_FACTOR,
        }
    }
}

fn validate_options(options: &LoaderOptions) -> Result<(), GtcError> {
    if options.page_size == 0 {
        return Err(GtcError::InvalidOptions("page_size must be greater than 0"));
    }
    if options.interleave_factor == 0 || options.interleave_factor > 64 {
        return Err(GtcError::InvalidOptions(
            "interleave_factor must be between 1 and 64",
        ));
    }
    Ok(())
}

/// Outcome of one request in a batch.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub id: usize,
    pub dst_offset: usize,
    pub output_bytes: usize,
    pub result: Result<(), GtcError>,
}

/// Everything a finished batch reports back.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<RequestOutcome>,
    pub release_event: Event,
    pub output_bytes: usize,
}

struct StagedRequest {
    id: usize,
    header: ImageHeader,
    container: Vec<u8>,
    dst_offset: usize,
}

/// Accumulates compressed images and flushes them as batched page
/// submissions sharing one staging allocation and one acquire/release of
/// the destination pixel buffer.
pub struct BatchDecoder {
    backend: Arc<dyn Backend>,
    options: LoaderOptions,
    output: OutputKind,
    requests: Vec<StagedRequest>,
    rejected: Vec<RequestOutcome>,
    next_id: usize,
    next_dst: usize,
}

impl BatchDecoder {
    pub fn new(
        backend: Arc<dyn Backend>,
        options: LoaderOptions,
        output: OutputKind,
    ) -> Result<Self, GtcError> {
        validate_options(&options)?;
        Ok(Self {
            backend,
            options,
            output,
            requests: Vec::new(),
            rejected: Vec::new(),
            next_id: 0,
            next_dst: 0,
        })
    }

    /// Parse and queue one compressed image. A malformed container drops
    /// only this request; the batch keeps going.
    pub fn enqueue_image(&mut self, container: Vec<u8>) -> Result<usize, GtcError> {
        let id = self.next_id;
        self.next_id += 1;

        let parsed = ImageHeader::parse(&container).and_then(|header| {
            if header.container_bytes() != container.len() {
                Err(GtcError::BadContainer(
                    "payload sizes disagree with container length",
                ))
            } else {
                Ok(header)
            }
        });
        match parsed {
            Ok(header) => {
                let dst_offset = self.next_dst;
                self.next_dst += header.output_bytes(self.output);
                self.requests.push(StagedRequest {
                    id,
                    header,
                    container,
                    dst_offset,
                });
                Ok(id)
            }
            Err(err) => {
                self.rejected.push(RequestOutcome {
                    id,
                    dst_offset: 0,
                    output_bytes: 0,
                    result: Err(err.clone()),
                });
                Err(err)
            }
        }
    }

    /// Total bytes the queued requests will write.
    pub fn output_bytes(&self) -> usize {
        self.next_dst
    }

    /// Stage, submit and await the whole batch.
    pub fn flush(self, pixels: &PixelBuffer) -> Result<BatchReport, GtcError> {
        let total_start = Instant::now();
        let Self {
            backend,
            options,
            output,
            requests,
            mut rejected,
            next_dst,
            ..
        } = self;

        if requests.is_empty() {
            rejected.sort_by_key(|outcome| outcome.id);
            return Ok(BatchReport {
                outcomes: rejected,
                release_event: Event::signaled(),
                output_bytes: 0,
            });
        }
        if next_dst > pixels.len() {
            return Err(GtcError::OutOfResources(
                "destination pixel buffer too small for batch".to_string(),
            ));
        }

        let scratch_bytes: usize = requests.iter().map(|req| req.header.scratch_bytes()).sum();
        backend.preallocate_scratch(scratch_bytes)?;

        // Page grouping and staging layout.
        let page_ranges: Vec<Range<usize>> = (0..requests.len())
            .step_by(options.page_size)
            .map(|start| start..(start + options.page_size).min(requests.len()))
            .collect();
        let mut staging_ranges = Vec::with_capacity(page_ranges.len());
        let mut staging_total = 0usize;
        for span in &page_ranges {
            let headers: Vec<ImageHeader> =
                requests[span.clone()].iter().map(|req| req.header).collect();
            let len = page_staging_bytes(&headers);
            staging_ranges.push(staging_total..staging_total + len);
            staging_total += len;
        }

        // Populate the pinned staging buffer, one worker per page. Each
        // worker owns a disjoint chunk, so the bytes need no locking.
        let stage_start = Instant::now();
        let mut staging = vec![0u8; staging_total];
        {
            let mut chunks: Vec<(&Range<usize>, &mut [u8])> = Vec::with_capacity(page_ranges.len());
            let mut rest = staging.as_mut_slice();
            for (span, range) in page_ranges.iter().zip(staging_ranges.iter()) {
                let (chunk, tail) = rest.split_at_mut(range.len());
                chunks.push((span, chunk));
                rest = tail;
            }
            if options.async_load && chunks.len() > 1 {
                std::thread::scope(|scope| {
                    for (span, chunk) in chunks {
                        let page_requests: Vec<(&ImageHeader, &[u8])> = requests[span.clone()]
                            .iter()
                            .map(|req| (&req.header, req.container.as_slice()))
                            .collect();
                        scope.spawn(move || fill_page_staging(chunk, &page_requests));
                    }
                });
            } else {
                for (span, chunk) in chunks {
                    let page_requests: Vec<(&ImageHeader, &[u8])> = requests[span.clone()]
                        .iter()
                        .map(|req| (&req.header, req.container.as_slice()))
                        .collect();
                    fill_page_staging(chunk, &page_requests);
                }
            }
        }
        let staging = Arc::new(staging);
        let stage_ms = elapsed_ms(stage_start);

        // The unmap of the pinned buffer serializes with downstream copies
        // through a user event: nothing runs until every page is queued and
        // the event is signaled.
        let user_event = Event::new();
        let acquire_event = backend.acquire_shared(pixels, &[user_event.clone()])?;

        let submit_start = Instant::now();
        let mut tickets = Vec::with_capacity(page_ranges.len());
        let mut submit_error: Option<GtcError> = None;
        for (span, range) in page_ranges.iter().zip(staging_ranges.iter()) {
            let page = PageSubmission {
                headers: requests[span.clone()].iter().map(|req| req.header).collect(),
                staging: Arc::clone(&staging),
                page_range: range.clone(),
                dst_offsets: requests[span.clone()]
                    .iter()
                    .map(|req| req.dst_offset)
                    .collect(),
                output,
                interleave: options.interleave_factor,
            };
            match backend.decode_page(page, pixels, &[acquire_event.clone()]) {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => {
                    submit_error = Some(err);
                    break;
                }
            }
        }
        user_event.signal();

        let page_events: Vec<Event> = tickets.iter().map(|ticket| ticket.event.clone()).collect();
        let release_event = backend.release_shared(pixels, &page_events)?;
        release_event.wait();
        backend.free_scratch();

        if let Some(err) = submit_error {
            // Device-side failures poison the whole batch: no partial
            // commits are reported.
            return Err(err);
        }

        let mut outcomes = rejected;
        for (span, ticket) in page_ranges.iter().zip(tickets.iter()) {
            let slots = ticket.results.lock().unwrap_or_else(|e| e.into_inner());
            for (request, slot) in requests[span.clone()].iter().zip(slots.iter()) {
                outcomes.push(RequestOutcome {
                    id: request.id,
                    dst_offset: request.dst_offset,
                    output_bytes: request.header.output_bytes(output),
                    result: match slot {
                        Some(err) => Err(err.clone()),
                        None => Ok(()),
                    },
                });
            }
        }
        outcomes.sort_by_key(|outcome| outcome.id);

        if options.profiling {
            println!(
                "[gtc_codec][timing][batch] backend={} requests={} pages={} stage_ms={:.3} submit_to_done_ms={:.3} total_ms={:.3}",
                backend.name(),
                requests.len(),
                page_ranges.len(),
                stage_ms,
                elapsed_ms(submit_start),
                elapsed_ms(total_start),
            );
        }

        Ok(BatchReport {
            outcomes,
            release_event,
            output_bytes: next_dst,
        })
    }
}

// ---------------------------------------------------------------------------
// Caller-facing entry points
// ---------------------------------------------------------------------------

/// Probe the backend for the features the decode pipeline needs.
pub fn initialize_decoder(backend: &dyn Backend) -> Result<(), GtcError> {
    backend.check_features()
}

/// Reserve device scratch ahead of a batch to amortize allocation.
pub fn preallocate_decompressor(backend: &dyn Backend, bytes: usize) -> Result<(), GtcError> {
    backend.preallocate_scratch(bytes)
}

pub fn free_decompressor(backend: &dyn Backend) {
    backend.free_scratch();
}

/// Scratch bytes one image needs on the device.
pub fn required_scratch_bytes(header: &ImageHeader) -> usize {
    header.scratch_bytes()
}

fn load_batch(
    backend: &Arc<dyn Backend>,
    containers: &[Vec<u8>],
    pixels: &PixelBuffer,
    options: &LoaderOptions,
    output: OutputKind,
) -> Result<BatchReport, GtcError> {
    let mut batch = BatchDecoder::new(Arc::clone(backend), options.clone(), output)?;
    for container in containers {
        // Bad containers surface in the report; the batch keeps going.
        let _ = batch.enqueue_image(container.clone());
    }
    batch.flush(pixels)
}

/// Decode one image into DXT blocks at offset 0 of the pixel buffer.
pub fn load_compressed_dxt(
    backend: &Arc<dyn Backend>,
    container: &[u8],
    pixels: &PixelBuffer,
    options: &LoaderOptions,
) -> Result<BatchReport, GtcError> {
    let containers = vec![container.to_vec()];
    load_batch(backend, &containers, pixels, options, OutputKind::Dxt)
}

/// Decode a page of images into contiguous DXT spans.
pub fn load_compressed_dxts(
    backend: &Arc<dyn Backend>,
    containers: &[Vec<u8>],
    pixels: &PixelBuffer,
    options: &LoaderOptions,
) -> Result<BatchReport, GtcError> {
    load_batch(backend, containers, pixels, options, OutputKind::Dxt)
}

/// Uncompressed-output variant: RGB bytes instead of DXT blocks.
pub fn load_rgb(
    backend: &Arc<dyn Backend>,
    container: &[u8],
    pixels: &PixelBuffer,
    options: &LoaderOptions,
) -> Result<BatchReport, GtcError> {
    let containers = vec![container.to_vec()];
    load_batch(backend, &containers, pixels, options, OutputKind::Rgb)
}

#[cfg(test)]
mod tests;
