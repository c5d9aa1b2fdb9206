use std::sync::{mpsc, Arc, Mutex, OnceLock};

use crate::{
    page_offsets_region_bytes, Backend, Event, GtcError, OutputKind, PageSubmission, PageTicket,
    PixelBuffer, PixelStorage, FREQ_TABLE_BYTES, FREQ_TABLE_ENTRIES, PLANES_PER_IMAGE,
};

// The decode kernel is compiled for exactly this many cooperating lanes.
const KERNEL_LANES: usize = 32;
const ANS_JOB_WORDS: usize = 8;
const ASSEMBLE_JOB_WORDS: usize = 12;
const ASSEMBLE_WORKGROUP: u32 = 64;
const EXPAND_WORKGROUP: u32 = 256;
// Shared memory used by the decode kernel: table + prefix sums + scan
// scratch, all u32.
const WORKGROUP_STORAGE_WORDS: usize = 2048 + 513 + 32 + 33 + 2;

// Status codes reported by the kernels, one slot per plane job plus one per
// request.
const STATUS_OK: u32 = 0;
const STATUS_UNDERFLOW: u32 = 1;
const STATUS_FINAL_STATE: u32 = 2;
const STATUS_TRAILING_WORDS: u32 = 3;
const STATUS_ALPHABET: u32 = 4;
const STATUS_TABLE_SUM: u32 = 5;
const STATUS_PALETTE_RANGE: u32 = 6;

const ANS_DECODE_SHADER: &str = r#"
const TABLE_SIZE: u32 = 2048u;
const TABLE_LOG2: u32 = 11u;
const NUM_LANES: u32 = 32u;
const STATE_UPPER: u32 = 134217728u; // 2^27

const STATUS_UNDERFLOW: u32 = 1u;
const STATUS_FINAL_STATE: u32 = 2u;
const STATUS_TRAILING_WORDS: u32 = 3u;
const STATUS_ALPHABET: u32 = 4u;
const STATUS_TABLE_SUM: u32 = 5u;

// Flat job records, 8 words each:
// [table_word_off, states_byte_off, stream_byte_off, stream_word_count,
//  total_symbols, out_byte_off, status_slot, pad]
@group(0) @binding(0)
var<storage, read> input_words: array<u32>;
@group(0) @binding(1)
var<storage, read> jobs: array<u32>;
@group(0) @binding(2)
var<storage, read_write> planes: array<atomic<u32>>;
@group(0) @binding(3)
var<storage, read_write> status: array<u32>;

var<workgroup> starts: array<u32, 513>;
var<workgroup> table: array<u32, 2048>;
var<workgroup> needs: array<u32, 32>;
var<workgroup> offsets: array<u32, 33>;
var<workgroup> cursor: u32;
var<workgroup> wg_error: atomic<u32>;

fn read_u16(byte_off: u32) -> u32 {
    let word = input_words[byte_off / 4u];
    return (word >> ((byte_off % 4u) * 8u)) & 0xffffu;
}

fn read_u32_le(byte_off: u32) -> u32 {
    return read_u16(byte_off) | (read_u16(byte_off + 2u) << 16u);
}

fn symbol_for_slot(slot: u32) -> u32 {
    var lo: u32 = 0u;
    var hi: u32 = 512u;
    loop {
        if (hi - lo <= 1u) {
            break;
        }
        let mid = (lo + hi) / 2u;
        if (starts[mid] <= slot) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    return lo;
}

@compute @workgroup_size(32, 1, 1)
fn decode_streams(
    @builtin(workgroup_id) group: vec3<u32>,
    @builtin(local_invocation_id) local: vec3<u32>,
) {
    let job_base = group.x * 8u;
    let table_word_off = jobs[job_base];
    let states_byte_off = jobs[job_base + 1u];
    let stream_byte_off = jobs[job_base + 2u];
    let stream_word_count = jobs[job_base + 3u];
    let total_symbols = jobs[job_base + 4u];
    let out_byte_off = jobs[job_base + 5u];
    let status_slot = jobs[job_base + 6u];
    let lane = local.x;

    if (lane == 0u) {
        atomicStore(&wg_error, 0u);
        cursor = 0u;
        var sum: u32 = 0u;
        for (var sym: u32 = 0u; sym < 512u; sym = sym + 1u) {
            starts[sym] = sum;
            let count = input_words[table_word_off + sym];
            if (sym >= 256u && count != 0u) {
                atomicStore(&wg_error, STATUS_ALPHABET);
            }
            sum = sum + count;
        }
        starts[512] = sum;
        if (sum != TABLE_SIZE) {
            atomicStore(&wg_error, STATUS_TABLE_SUM);
        }
    }
    workgroupBarrier();

    // Fill the range-packed decode table, 64 slots per lane. Entries pack
    // symbol (8 bits), frequency (12) and bucket start (12) into one word.
    if (atomicLoad(&wg_error) == 0u) {
        for (var i: u32 = 0u; i < 64u; i = i + 1u) {
            let slot = lane * 64u + i;
            let sym = symbol_for_slot(slot);
            let start = starts[sym];
            let freq = starts[sym + 1u] - start;
            table[slot] = (sym & 0xffu) | (freq << 8u) | (start << 20u);
        }
    }
    workgroupBarrier();

    var lane_len: u32 = 0u;
    if (lane < total_symbols) {
        lane_len = (total_symbols - lane + NUM_LANES - 1u) / NUM_LANES;
    }
    let max_len = (total_symbols + NUM_LANES - 1u) / NUM_LANES;

    var state = read_u32_le(states_byte_off + lane * 4u);
    if (state < TABLE_SIZE || state >= STATE_UPPER) {
        atomicMax(&wg_error, STATUS_UNDERFLOW);
    }

    // Lockstep decode, newest step first. Each lane decodes one symbol,
    // then refill words are claimed in ascending lane order through an
    // exclusive scan over per-lane needs.
    for (var step_plus: u32 = max_len; step_plus > 0u; step_plus = step_plus - 1u) {
        let step = step_plus - 1u;
        let failed = atomicLoad(&wg_error) != 0u;
        let is_active = !failed && step < lane_len;
        if (is_active) {
            let slot = state & (TABLE_SIZE - 1u);
            let entry = table[slot];
            let sym = entry & 0xffu;
            let freq = (entry >> 8u) & 0xfffu;
            let start = entry >> 20u;
            state = freq * (state >> TABLE_LOG2) + slot - start;
            let pos = step * NUM_LANES + lane;
            let byte_off = out_byte_off + pos;
            atomicOr(&planes[byte_off / 4u], sym << ((byte_off % 4u) * 8u));
        }
        var need: u32 = 0u;
        if (is_active && state < TABLE_SIZE) {
            need = 1u;
        }
        needs[lane] = need;
        workgroupBarrier();
        if (lane == 0u) {
            var running: u32 = 0u;
            for (var i: u32 = 0u; i < NUM_LANES; i = i + 1u) {
                offsets[i] = running;
                running = running + needs[i];
            }
            offsets[NUM_LANES] = running;
        }
        workgroupBarrier();
        if (need == 1u) {
            let w = cursor + offsets[lane];
            if (w >= stream_word_count) {
                atomicMax(&wg_error, STATUS_UNDERFLOW);
            } else {
                // The stream is consumed in reverse word order.
                let word = read_u16(stream_byte_off + (stream_word_count - 1u - w) * 2u);
                state = (state << 16u) | word;
            }
        }
        workgroupBarrier();
        if (lane == 0u) {
            cursor = cursor + offsets[NUM_LANES];
        }
        workgroupBarrier();
    }

    if (atomicLoad(&wg_error) == 0u && state != TABLE_SIZE) {
        atomicMax(&wg_error, STATUS_FINAL_STATE);
    }
    workgroupBarrier();
    if (lane == 0u) {
        var code = atomicLoad(&wg_error);
        if (code == 0u && cursor != stream_word_count) {
            code = STATUS_TRAILING_WORDS;
        }
        status[status_slot] = code;
    }
}
"#;

const ASSEMBLE_DXT_SHADER: &str = r#"
const STATUS_PALETTE_RANGE: u32 = 6u;

// Flat job records, 12 words each:
// [block_count, y_off, chroma_off, palette_off, indices_off,
//  palette_entries, dst_word_off, request_index, blocks_x, width,
//  out_words, request_status_slot]
@group(0) @binding(0)
var<storage, read> planes: array<u32>;
@group(0) @binding(1)
var<storage, read> jobs: array<u32>;
@group(0) @binding(2)
var<storage, read_write> dst: array<u32>;
@group(0) @binding(3)
var<storage, read_write> status: array<atomic<u32>>;

fn plane_byte(byte_off: u32) -> u32 {
    return (planes[byte_off / 4u] >> ((byte_off % 4u) * 8u)) & 0xffu;
}

fn plane_u32(byte_off: u32) -> u32 {
    return plane_byte(byte_off)
        | (plane_byte(byte_off + 1u) << 8u)
        | (plane_byte(byte_off + 2u) << 16u)
        | (plane_byte(byte_off + 3u) << 24u);
}

fn clamp_channel(v: i32) -> u32 {
    return u32(clamp(v, 0, 255));
}

fn ycocg_to_565(y: u32, co_biased: u32, cg_biased: u32) -> u32 {
    let y_i = i32(y);
    let co = i32(co_biased) - 128;
    let cg = i32(cg_biased) - 128;
    let r = clamp_channel(y_i + co - cg);
    let g = clamp_channel(y_i + cg);
    let b = clamp_channel(y_i - co - cg);
    return ((r >> 3u) << 11u) | ((g >> 2u) << 5u) | (b >> 3u);
}

@compute @workgroup_size(64, 1, 1)
fn assemble_blocks(@builtin(global_invocation_id) gid: vec3<u32>) {
    let job_base = gid.y * 12u;
    let block_count = jobs[job_base];
    let block = gid.x;
    if (block >= block_count) {
        return;
    }
    let request = jobs[job_base + 7u];
    let plane_status_base = request * 4u;
    for (var p: u32 = 0u; p < 4u; p = p + 1u) {
        if (atomicLoad(&status[plane_status_base + p]) != 0u) {
            return;
        }
    }

    let y_off = jobs[job_base + 1u];
    let chroma_off = jobs[job_base + 2u];
    let palette_off = jobs[job_base + 3u];
    let indices_off = jobs[job_base + 4u];
    let palette_entries = jobs[job_base + 5u];
    let dst_word_off = jobs[job_base + 6u];

    let index = plane_byte(indices_off + block);
    if (index >= palette_entries) {
        atomicMax(&status[jobs[job_base + 11u]], STATUS_PALETTE_RANGE);
        return;
    }
    let selector = plane_u32(palette_off + index * 4u);

    let c0 = ycocg_to_565(
        plane_byte(y_off + block),
        plane_byte(chroma_off + block),
        plane_byte(chroma_off + block_count + block),
    );
    let c1 = ycocg_to_565(
        plane_byte(y_off + block_count + block),
        plane_byte(chroma_off + 2u * block_count + block),
        plane_byte(chroma_off + 3u * block_count + block),
    );

    dst[dst_word_off + block * 2u] = c0 | (c1 << 16u);
    dst[dst_word_off + block * 2u + 1u] = selector;
}
"#;

const EXPAND_RGB_SHADER: &str = r#"
const STATUS_PALETTE_RANGE: u32 = 6u;

@group(0) @binding(0)
var<storage, read> planes: array<u32>;
@group(0) @binding(1)
var<storage, read> jobs: array<u32>;
@group(0) @binding(2)
var<storage, read_write> dst: array<u32>;
@group(0) @binding(3)
var<storage, read_write> status: array<atomic<u32>>;

fn plane_byte(byte_off: u32) -> u32 {
    return (planes[byte_off / 4u] >> ((byte_off % 4u) * 8u)) & 0xffu;
}

fn plane_u32(byte_off: u32) -> u32 {
    return plane_byte(byte_off)
        | (plane_byte(byte_off + 1u) << 8u)
        | (plane_byte(byte_off + 2u) << 16u)
        | (plane_byte(byte_off + 3u) << 24u);
}

fn clamp_channel(v: i32) -> u32 {
    return u32(clamp(v, 0, 255));
}

fn expand5(v: u32) -> u32 {
    return (v * 255u + 15u) / 31u;
}

fn expand6(v: u32) -> u32 {
    return (v * 255u + 31u) / 63u;
}

fn ycocg_to_565(y: u32, co_biased: u32, cg_biased: u32) -> u32 {
    let y_i = i32(y);
    let co = i32(co_biased) - 128;
    let cg = i32(cg_biased) - 128;
    let r = clamp_channel(y_i + co - cg);
    let g = clamp_channel(y_i + cg);
    let b = clamp_channel(y_i - co - cg);
    return ((r >> 3u) << 11u) | ((g >> 2u) << 5u) | (b >> 3u);
}

fn channel_565(color: u32, channel: u32) -> u32 {
    if (channel == 0u) {
        return expand5((color >> 11u) & 0x1fu);
    }
    if (channel == 1u) {
        return expand6((color >> 5u) & 0x3fu);
    }
    return expand5(color & 0x1fu);
}

// One invocation per output word of one request's RGB span. Every byte of
// the word is derived independently, so no two invocations touch the same
// destination word.
@compute @workgroup_size(256, 1, 1)
fn expand_rgb(@builtin(global_invocation_id) gid: vec3<u32>) {
    let job_base = gid.y * 12u;
    let out_words = jobs[job_base + 10u];
    if (gid.x >= out_words) {
        return;
    }
    let request = jobs[job_base + 7u];
    let plane_status_base = request * 4u;
    for (var p: u32 = 0u; p < 4u; p = p + 1u) {
        if (atomicLoad(&status[plane_status_base + p]) != 0u) {
            return;
        }
    }

    let block_count = jobs[job_base];
    let y_off = jobs[job_base + 1u];
    let chroma_off = jobs[job_base + 2u];
    let palette_off = jobs[job_base + 3u];
    let indices_off = jobs[job_base + 4u];
    let palette_entries = jobs[job_base + 5u];
    let dst_word_off = jobs[job_base + 6u];
    let blocks_x = jobs[job_base + 8u];
    let width = jobs[job_base + 9u];

    var out_word: u32 = 0u;
    let base_byte = gid.x * 4u;
    for (var k: u32 = 0u; k < 4u; k = k + 1u) {
        let byte_index = base_byte + k;
        let pixel = byte_index / 3u;
        let channel = byte_index % 3u;
        let px = pixel % width;
        let py = pixel / width;
        let block = (py / 4u) * blocks_x + px / 4u;
        if (block >= block_count) {
            continue;
        }
        let index = plane_byte(indices_off + block);
        if (index >= palette_entries) {
            atomicMax(&status[jobs[job_base + 11u]], STATUS_PALETTE_RANGE);
            return;
        }
        let selector = plane_u32(palette_off + index * 4u);
        let texel = (py % 4u) * 4u + (px % 4u);
        let code = (selector >> (2u * texel)) & 0x3u;

        let c0 = ycocg_to_565(
            plane_byte(y_off + block),
            plane_byte(chroma_off + block),
            plane_byte(chroma_off + block_count + block),
        );
        let c1 = ycocg_to_565(
            plane_byte(y_off + block_count + block),
            plane_byte(chroma_off + 2u * block_count + block),
            plane_byte(chroma_off + 3u * block_count + block),
        );
        var value: u32;
        if (code == 0u) {
            value = channel_565(c0, channel);
        } else if (code == 1u) {
            value = channel_565(c1, channel);
        } else if (code == 2u) {
            value = (2u * channel_565(c0, channel) + channel_565(c1, channel)) / 3u;
        } else {
            value = (channel_565(c0, channel) + 2u * channel_565(c1, channel)) / 3u;
        }
        out_word = out_word | (value << (k * 8u));
    }
    dst[dst_word_off + gid.x] = out_word;
}
"#;

struct GpuRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    ans_pipeline: wgpu::ComputePipeline,
    assemble_pipeline: wgpu::ComputePipeline,
    expand_rgb_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuRuntime {
    fn init() -> Result<Self, GtcError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GtcError::DeviceUnsupported("no suitable GPU adapter".to_string()))?;

        let limits = adapter.limits();
        if (limits.max_compute_workgroup_storage_size as usize) < WORKGROUP_STORAGE_WORDS * 4 {
            return Err(GtcError::DeviceUnsupported(
                "adapter lacks workgroup storage for the decode table".to_string(),
            ));
        }
        if limits.max_compute_workgroup_size_x < KERNEL_LANES as u32 {
            return Err(GtcError::DeviceUnsupported(
                "adapter cannot run 32-lane workgroups".to_string(),
            ));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gtc-decoder-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|e| GtcError::DeviceUnsupported(format!("request_device failed: {e}")))?;

        let ans_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gtc-ans-decode"),
            source: wgpu::ShaderSource::Wgsl(ANS_DECODE_SHADER.into()),
        });
        let assemble_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gtc-assemble-dxt"),
            source: wgpu::ShaderSource::Wgsl(ASSEMBLE_DXT_SHADER.into()),
        });
        let expand_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gtc-expand-rgb"),
            source: wgpu::ShaderSource::Wgsl(EXPAND_RGB_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gtc-bgl"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gtc-pl"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let ans_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gtc-ans-decode-cp"),
            layout: Some(&pipeline_layout),
            module: &ans_shader,
            entry_point: "decode_streams",
        });
        let assemble_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gtc-assemble-dxt-cp"),
            layout: Some(&pipeline_layout),
            module: &assemble_shader,
            entry_point: "assemble_blocks",
        });
        let expand_rgb_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gtc-expand-rgb-cp"),
            layout: Some(&pipeline_layout),
            module: &expand_shader,
            entry_point: "expand_rgb",
        });

        Ok(Self {
            device,
            queue,
            ans_pipeline,
            assemble_pipeline,
            expand_rgb_pipeline,
            bind_group_layout,
        })
    }
}

fn runtime() -> Result<&'static GpuRuntime, GtcError> {
    static RUNTIME: OnceLock<Result<GpuRuntime, GtcError>> = OnceLock::new();
    RUNTIME
        .get_or_init(GpuRuntime::init)
        .as_ref()
        .map_err(|e| e.clone())
}

pub(crate) struct GpuPixelStorage {
    pub buffer: Arc<wgpu::Buffer>,
}

struct PageBuffers {
    staging_capacity: usize,
    ans_jobs_capacity: usize,
    assemble_jobs_capacity: usize,
    scratch_capacity: usize,
    status_capacity: usize,
    staging: wgpu::Buffer,
    ans_jobs: wgpu::Buffer,
    assemble_jobs: wgpu::Buffer,
    scratch: wgpu::Buffer,
    status: wgpu::Buffer,
    status_readback: wgpu::Buffer,
}

fn word_padded(bytes: usize) -> usize {
    bytes.div_ceil(4) * 4
}

fn create_page_buffers(
    runtime: &GpuRuntime,
    staging_capacity: usize,
    ans_jobs_capacity: usize,
    assemble_jobs_capacity: usize,
    scratch_capacity: usize,
    status_capacity: usize,
) -> PageBuffers {
    let make = |label: &str, size: usize, usage: wgpu::BufferUsages| {
        runtime.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4) as u64,
            usage,
            mapped_at_creation: false,
        })
    };
    PageBuffers {
        staging_capacity,
        ans_jobs_capacity,
        assemble_jobs_capacity,
        scratch_capacity,
        status_capacity,
        staging: make(
            "gtc-page-staging",
            staging_capacity,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        ),
        ans_jobs: make(
            "gtc-ans-jobs",
            ans_jobs_capacity,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        ),
        assemble_jobs: make(
            "gtc-assemble-jobs",
            assemble_jobs_capacity,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        ),
        scratch: make(
            "gtc-plane-scratch",
            scratch_capacity,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        ),
        status: make(
            "gtc-status",
            status_capacity,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        ),
        status_readback: make(
            "gtc-status-readback",
            status_capacity,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        ),
    }
}

/// wgpu compute backend. The decode pipeline runs as two passes: the
/// 32-lane cooperative tANS decode into plane scratch, then block assembly
/// straight into the shared pixel buffer.
pub struct WgpuBackend {
    runtime: &'static GpuRuntime,
    pool: Arc<Mutex<Vec<PageBuffers>>>,
    scratch_reserved: Mutex<usize>,
}

impl WgpuBackend {
    pub fn new() -> Result<Self, GtcError> {
        Ok(Self {
            runtime: runtime()?,
            pool: Arc::new(Mutex::new(Vec::new())),
            scratch_reserved: Mutex::new(0),
        })
    }

    pub fn is_available() -> bool {
        runtime().is_ok()
    }

    fn acquire_page_buffers(
        &self,
        staging: usize,
        ans_jobs: usize,
        assemble_jobs: usize,
        scratch: usize,
        status: usize,
    ) -> PageBuffers {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = pool.iter().position(|entry| {
            entry.staging_capacity >= staging
                && entry.ans_jobs_capacity >= ans_jobs
                && entry.assemble_jobs_capacity >= assemble_jobs
                && entry.scratch_capacity >= scratch
                && entry.status_capacity >= status
        }) {
            return pool.swap_remove(pos);
        }
        drop(pool);
        create_page_buffers(
            self.runtime,
            staging,
            ans_jobs,
            assemble_jobs,
            scratch,
            status,
        )
    }
}

struct RequestJobPlan {
    skip: Option<GtcError>,
    scratch_base: usize,
}

fn status_code_error(code: u32) -> GtcError {
    match code {
        STATUS_UNDERFLOW => GtcError::MalformedStream("stream underflow on device"),
        STATUS_FINAL_STATE => GtcError::MalformedStream("final state mismatch on device"),
        STATUS_TRAILING_WORDS => GtcError::MalformedStream("trailing data after device decode"),
        STATUS_ALPHABET => GtcError::AlphabetTooLarge(FREQ_TABLE_ENTRIES),
        STATUS_TABLE_SUM => GtcError::BadContainer("frequency table does not sum to table size"),
        STATUS_PALETTE_RANGE => GtcError::MalformedStream("palette index out of range"),
        _ => GtcError::MalformedStream("unknown device status"),
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn check_features(&self) -> Result<(), GtcError> {
        // Adapter and limit checks run during runtime init.
        Ok(())
    }

    fn base_address_alignment(&self) -> usize {
        256
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
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.clear();
    }

    fn create_pixel_buffer(&self, bytes: usize) -> Result<PixelBuffer, GtcError> {
        let buffer = self.runtime.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gtc-pixel-buffer"),
            size: word_padded(bytes).max(4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(PixelBuffer::new(
            bytes,
            PixelStorage::Device(GpuPixelStorage {
                buffer: Arc::new(buffer),
            }),
        ))
    }

    fn read_pixels(&self, pixels: &PixelBuffer) -> Result<Vec<u8>, GtcError> {
        let buffer = match &pixels.storage {
            PixelStorage::Device(storage) => Arc::clone(&storage.buffer),
            PixelStorage::Host(_) => {
                return Err(GtcError::InteropFailure(
                    "host pixel buffer handed to wgpu backend".to_string(),
                ))
            }
        };
        let padded = word_padded(pixels.len()).max(4);
        let readback = self.runtime.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gtc-pixel-readback"),
            size: padded as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .runtime
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gtc-pixel-readback-encoder"),
            });
        encoder.copy_buffer_to_buffer(&buffer, 0, &readback, 0, padded as u64);
        self.runtime.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.runtime.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| GtcError::InteropFailure("pixel readback channel closed".to_string()))?
            .map_err(|e| GtcError::InteropFailure(format!("pixel readback map failed: {e}")))?;
        let mut out = slice.get_mapped_range().to_vec();
        readback.unmap();
        out.truncate(pixels.len());
        Ok(out)
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
        // Page events fire only after their submissions complete, so the
        // device is quiet for this buffer by now.
        pixels.mark_released()?;
        Ok(Event::signaled())
    }

    fn decode_page(
        &self,
        page: PageSubmission,
        pixels: &PixelBuffer,
        wait: &[Event],
    ) -> Result<PageTicket, GtcError> {
        if page.interleave != KERNEL_LANES {
            return Err(GtcError::InvalidOptions(
                "wgpu backend requires interleave_factor 32",
            ));
        }
        let dst_buffer = match &pixels.storage {
            PixelStorage::Device(storage) => Arc::clone(&storage.buffer),
            PixelStorage::Host(_) => {
                return Err(GtcError::InteropFailure(
                    "host pixel buffer handed to wgpu backend".to_string(),
                ))
            }
        };

        let request_count = page.headers.len();
        let event = Event::new();
        let results: Arc<Mutex<Vec<Option<GtcError>>>> =
            Arc::new(Mutex::new(vec![None; request_count]));
        let ticket = PageTicket {
            event: event.clone(),
            results: Arc::clone(&results),
        };

        // Per-request scratch bases and skip decisions happen on the host;
        // the kernels only ever see well-formed jobs.
        let mut plans = Vec::with_capacity(request_count);
        let mut scratch_total = 0usize;
        for header in &page.headers {
            let mut skip = None;
            for size in header.payload_sizes() {
                if size < 4 * KERNEL_LANES || (size - 4 * KERNEL_LANES) % 2 != 0 {
                    skip = Some(GtcError::BadContainer("payload too small for stream states"));
                }
            }
            plans.push(RequestJobPlan {
                skip,
                scratch_base: scratch_total,
            });
            scratch_total += word_padded(header.scratch_bytes());
        }

        let freq_base = page_offsets_region_bytes(request_count);
        let payload_base = freq_base + request_count * PLANES_PER_IMAGE * FREQ_TABLE_BYTES;

        let mut ans_jobs: Vec<u32> = Vec::new();
        let mut assemble_jobs: Vec<u32> = Vec::with_capacity(request_count * ASSEMBLE_JOB_WORDS);
        let mut payload_cursor = payload_base;
        let mut max_assemble_x = 0u32;
        for (request, header) in page.headers.iter().enumerate() {
            let plan = &plans[request];
            let sizes = header.payload_sizes();
            let counts = header.plane_symbol_counts();
            let blocks = header.block_count();
            let scratch_base = plan.scratch_base;

            // Plane scratch layout per request: y | chroma | palette | idx.
            let plane_offs = [
                scratch_base,
                scratch_base + counts[0],
                scratch_base + counts[0] + counts[1],
                scratch_base + counts[0] + counts[1] + counts[2],
            ];
            if plan.skip.is_none() {
                for plane in 0..PLANES_PER_IMAGE {
                    let table_off = freq_base + (request * PLANES_PER_IMAGE + plane) * FREQ_TABLE_BYTES;
                    let states_off = payload_cursor;
                    let stream_off = states_off + 4 * KERNEL_LANES;
                    let stream_words = (sizes[plane] - 4 * KERNEL_LANES) / 2;
                    ans_jobs.extend_from_slice(&[
                        (table_off / 4) as u32,
                        states_off as u32,
                        stream_off as u32,
                        stream_words as u32,
                        counts[plane] as u32,
                        plane_offs[plane] as u32,
                        (request * PLANES_PER_IMAGE + plane) as u32,
                        0,
                    ]);
                    payload_cursor += sizes[plane];
                }
            } else {
                payload_cursor += sizes.iter().sum::<usize>();
            }

            let (dst_word_off, out_words) = match page.output {
                OutputKind::Dxt => (page.dst_offsets[request] / 4, blocks * 2),
                OutputKind::Rgb => (page.dst_offsets[request] / 4, header.rgb_bytes() / 4),
            };
            let enabled = plan.skip.is_none();
            assemble_jobs.extend_from_slice(&[
                if enabled { blocks as u32 } else { 0 },
                plane_offs[0] as u32,
                plane_offs[1] as u32,
                plane_offs[2] as u32,
                plane_offs[3] as u32,
                (header.palette_bytes / 4) as u32,
                dst_word_off as u32,
                request as u32,
                header.width / 4,
                header.width,
                if enabled { out_words as u32 } else { 0 },
                (request_count * PLANES_PER_IMAGE + request) as u32,
            ]);
            let x_items = match page.output {
                OutputKind::Dxt => blocks as u32,
                OutputKind::Rgb => out_words as u32,
            };
            if enabled {
                max_assemble_x = max_assemble_x.max(x_items);
            }
        }

        let staging_bytes = word_padded(page.page_range.len());
        let ans_jobs_bytes = word_padded(ans_jobs.len() * 4).max(ANS_JOB_WORDS * 4);
        let assemble_jobs_bytes = word_padded(assemble_jobs.len() * 4);
        // One status slot per plane job plus one per request.
        let status_words = request_count * PLANES_PER_IMAGE + request_count;
        let status_bytes = status_words * 4;

        let runtime = self.runtime;
        let buffers = self.acquire_page_buffers(
            staging_bytes,
            ans_jobs_bytes,
            assemble_jobs_bytes,
            scratch_total.max(4),
            status_bytes,
        );
        let pool = Arc::clone(&self.pool);

        let wait: Vec<Event> = wait.to_vec();
        let ans_job_count = ans_jobs.len() / ANS_JOB_WORDS;
        let output = page.output;
        let headers = page.headers.clone();
        let staging_arc = Arc::clone(&page.staging);
        let page_range = page.page_range.clone();
        let skip_errors: Vec<Option<GtcError>> =
            plans.iter().map(|plan| plan.skip.clone()).collect();

        std::thread::spawn(move || {
            Event::wait_all(&wait);

            let staging_slice = &staging_arc[page_range.clone()];
            let mut padded = staging_slice.to_vec();
            padded.resize(word_padded(padded.len()), 0);
            runtime.queue.write_buffer(&buffers.staging, 0, &padded);
            if !ans_jobs.is_empty() {
                let mut job_bytes = Vec::with_capacity(ans_jobs.len() * 4);
                for word in &ans_jobs {
                    job_bytes.extend_from_slice(&word.to_le_bytes());
                }
                runtime.queue.write_buffer(&buffers.ans_jobs, 0, &job_bytes);
            }
            let mut assemble_bytes = Vec::with_capacity(assemble_jobs.len() * 4);
            for word in &assemble_jobs {
                assemble_bytes.extend_from_slice(&word.to_le_bytes());
            }
            runtime
                .queue
                .write_buffer(&buffers.assemble_jobs, 0, &assemble_bytes);

            let mut encoder =
                runtime
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("gtc-decode-encoder"),
                    });
            encoder.clear_buffer(&buffers.scratch, 0, None);
            encoder.clear_buffer(&buffers.status, 0, None);
            if ans_job_count > 0 {
                let ans_bind = runtime.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("gtc-ans-bg"),
                    layout: &runtime.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffers.staging.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: buffers.ans_jobs.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: buffers.scratch.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: buffers.status.as_entire_binding(),
                        },
                    ],
                });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("gtc-ans-pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&runtime.ans_pipeline);
                pass.set_bind_group(0, &ans_bind, &[]);
                pass.dispatch_workgroups(ans_job_count as u32, 1, 1);
            }
            if max_assemble_x > 0 {
                let assemble_bind = runtime.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("gtc-assemble-bg"),
                    layout: &runtime.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffers.scratch.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: buffers.assemble_jobs.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: dst_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: buffers.status.as_entire_binding(),
                        },
                    ],
                });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("gtc-assemble-pass"),
                    timestamp_writes: None,
                });
                let group_size = match output {
                    OutputKind::Dxt => {
                        pass.set_pipeline(&runtime.assemble_pipeline);
                        ASSEMBLE_WORKGROUP
                    }
                    OutputKind::Rgb => {
                        pass.set_pipeline(&runtime.expand_rgb_pipeline);
                        EXPAND_WORKGROUP
                    }
                };
                pass.set_bind_group(0, &assemble_bind, &[]);
                pass.dispatch_workgroups(
                    max_assemble_x.div_ceil(group_size),
                    headers.len() as u32,
                    1,
                );
            }
            encoder.copy_buffer_to_buffer(
                &buffers.status,
                0,
                &buffers.status_readback,
                0,
                status_bytes as u64,
            );
            runtime.queue.submit(Some(encoder.finish()));

            let slice = buffers.status_readback.slice(..status_bytes as u64);
            let (tx, rx) = mpsc::channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
            runtime.device.poll(wgpu::Maintain::Wait);

            let mut slots = results.lock().unwrap_or_else(|e| e.into_inner());
            match rx.recv() {
                Ok(Ok(())) => {
                    let mapped = slice.get_mapped_range();
                    let codes: Vec<u32> = mapped
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    drop(mapped);
                    buffers.status_readback.unmap();
                    for (request, skip) in skip_errors.iter().enumerate() {
                        if let Some(err) = skip {
                            slots[request] = Some(err.clone());
                            continue;
                        }
                        let plane_codes =
                            &codes[request * PLANES_PER_IMAGE..(request + 1) * PLANES_PER_IMAGE];
                        if let Some(&code) = plane_codes.iter().find(|&&code| code != STATUS_OK) {
                            slots[request] = Some(status_code_error(code));
                            continue;
                        }
                        let request_code = codes[headers.len() * PLANES_PER_IMAGE + request];
                        if request_code != STATUS_OK {
                            slots[request] = Some(status_code_error(request_code));
                        }
                    }
                }
                _ => {
                    for slot in slots.iter_mut() {
                        *slot = Some(GtcError::InteropFailure(
                            "device status readback failed".to_string(),
                        ));
                    }
                }
            }
            drop(slots);
            {
                let mut pool = pool.lock().unwrap_or_else(|e| e.into_inner());
                pool.push(buffers);
            }
            event.signal();
        });

        Ok(ticket)
    }
}
