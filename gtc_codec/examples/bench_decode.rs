use std::sync::Arc;
use std::time::Instant;

use gtc_codec::{
    encode_planes, load_compressed_dxts, planes_from_rgb, Backend, CpuBackend, LoaderOptions,
    WgpuBackend, DEFAULT_INTERLEAVE_FACTOR,
};

fn synthetic_rgb(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9).wrapping_add(1);
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let base = ((x + y * 2) % 256) as u32;
            rgb.push(((base + (state >> 28)) & 0xff) as u8);
            rgb.push(((base / 2 + (state >> 29)) & 0xff) as u8);
            rgb.push(((255 - base + (state >> 30)) & 0xff) as u8);
        }
    }
    rgb
}

fn run_batch(
    label: &str,
    backend: &Arc<dyn Backend>,
    containers: &[Vec<u8>],
    output_bytes: usize,
) {
    let options = LoaderOptions {
        profiling: true,
        ..LoaderOptions::default()
    };
    let pixels = backend
        .create_pixel_buffer(output_bytes)
        .expect("pixel buffer");
    let start = Instant::now();
    let report =
        load_compressed_dxts(backend, containers, &pixels, &options).expect("batch decode");
    let elapsed = start.elapsed().as_secs_f64();
    let failed = report
        .outcomes
        .iter()
        .filter(|outcome| outcome.result.is_err())
        .count();
    println!(
        "[{label}] images={} output_mib={:.2} decode_ms={:.3} throughput_mib_s={:.1} failed={failed}",
        containers.len(),
        output_bytes as f64 / (1024.0 * 1024.0),
        elapsed * 1000.0,
        output_bytes as f64 / (1024.0 * 1024.0) / elapsed,
    );
}

fn main() {
    const IMAGES: usize = 64;
    const SIZE: u32 = 256;

    println!("building {IMAGES} containers of {SIZE}x{SIZE}...");
    let containers: Vec<Vec<u8>> = (0..IMAGES)
        .map(|i| {
            let rgb = synthetic_rgb(SIZE, SIZE, i as u32);
            let planes = planes_from_rgb(SIZE, SIZE, &rgb).expect("planes");
            encode_planes(&planes, SIZE, SIZE, DEFAULT_INTERLEAVE_FACTOR).expect("encode")
        })
        .collect();
    let compressed: usize = containers.iter().map(|c| c.len()).sum();
    let region = (SIZE * SIZE / 16 * 8) as usize;
    let output_bytes = IMAGES * region;
    println!(
        "compressed_mib={:.2} dxt_mib={:.2} ratio={:.3}",
        compressed as f64 / (1024.0 * 1024.0),
        output_bytes as f64 / (1024.0 * 1024.0),
        compressed as f64 / output_bytes as f64,
    );

    let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
    run_batch("cpu", &cpu, &containers, output_bytes);

    if WgpuBackend::is_available() {
        match WgpuBackend::new() {
            Ok(backend) => {
                let gpu: Arc<dyn Backend> = Arc::new(backend);
                run_batch("wgpu", &gpu, &containers, output_bytes);
            }
            Err(err) => println!("wgpu backend unavailable: {err}"),
        }
    } else {
        println!("no GPU adapter found; skipping wgpu run");
    }
}
