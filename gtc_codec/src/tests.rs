use super::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn gradient_rgb(width: u32, height: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            rgb.push(((x * 255) / width.max(1)) as u8);
            rgb.push(((y * 255) / height.max(1)) as u8);
            rgb.push(((x + y) % 256) as u8);
        }
    }
    rgb
}

fn noise_rgb(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..width as usize * height as usize * 3)
        .map(|_| rng.gen())
        .collect()
}

fn make_container(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let rgb = noise_rgb(width, height, seed);
    let planes = planes_from_rgb(width, height, &rgb).expect("plane derivation");
    encode_planes(&planes, width, height, DEFAULT_INTERLEAVE_FACTOR).expect("container encode")
}

fn sample_header() -> ImageHeader {
    ImageHeader {
        width: 128,
        height: 128,
        palette_bytes: 64,
        y_cmp_sz: 2000,
        chroma_cmp_sz: 3000,
        palette_sz: 200,
        indices_sz: 800,
    }
}

#[test]
fn header_roundtrips_through_48_bytes() {
    let header = sample_header();
    let mut bytes = Vec::new();
    header.write_to(&mut bytes);
    assert_eq!(bytes.len(), HEADER_BYTES);
    let parsed = ImageHeader::parse(&bytes).expect("parse");
    assert_eq!(parsed, header);
}

#[test]
fn header_rejects_bad_geometry_and_sizes() {
    let mut header = sample_header();
    header.width = 130;
    assert!(matches!(header.validate(), Err(GtcError::BadContainer(_))));

    let mut header = sample_header();
    header.height = 0;
    assert!(matches!(header.validate(), Err(GtcError::BadContainer(_))));

    let mut header = sample_header();
    header.palette_bytes = 6;
    assert!(matches!(header.validate(), Err(GtcError::BadContainer(_))));

    let mut header = sample_header();
    header.y_cmp_sz = 0;
    assert!(matches!(header.validate(), Err(GtcError::BadContainer(_))));

    let mut header = sample_header();
    header.palette_bytes = (MAX_PALETTE_ENTRIES as u64 + 1) * 4;
    assert!(matches!(header.validate(), Err(GtcError::BadContainer(_))));
}

#[test]
fn plane_sizes_follow_block_count() {
    let header = sample_header();
    assert_eq!(header.block_count(), 1024);
    assert_eq!(header.dxt_bytes(), 8192);
    assert_eq!(header.rgb_bytes(), 128 * 128 * 3);
    assert_eq!(header.plane_symbol_counts(), [2048, 4096, 64, 1024]);
    assert_eq!(header.scratch_bytes(), 2048 + 4096 + 64 + 1024);
}

#[test]
fn rank_lengths_cover_strided_split() {
    assert_eq!(rank_lengths(10, 4), vec![3, 3, 2, 2]);
    assert_eq!(rank_lengths(8, 4), vec![2, 2, 2, 2]);
    assert_eq!(rank_lengths(2, 4), vec![1, 1, 0, 0]);
    let plane: Vec<u8> = (0..37).map(|i| (i * 7) as u8).collect();
    let ranks = split_strided(&plane, 5);
    for (rank, symbols) in ranks.iter().enumerate() {
        for (index, &symbol) in symbols.iter().enumerate() {
            assert_eq!(symbol, plane[index * 5 + rank]);
        }
    }
    assert_eq!(merge_strided(&ranks, plane.len()), plane);
}

#[test]
fn freq_table_serialization_keeps_upper_slots_zero() {
    let normalized = vec![7u32; 200];
    let mut bytes = Vec::new();
    serialize_freq_table(&normalized, &mut bytes);
    assert_eq!(bytes.len(), FREQ_TABLE_BYTES);
    let parsed = parse_freq_table(&bytes).expect("parse");
    assert_eq!(parsed.len(), 256);
    assert_eq!(&parsed[..200], normalized.as_slice());
    assert!(parsed[200..].iter().all(|&count| count == 0));

    // A count in the upper half claims a symbol wider than one byte.
    let mut corrupt = bytes.clone();
    corrupt[300 * 4] = 1;
    assert!(matches!(
        parse_freq_table(&corrupt),
        Err(GtcError::AlphabetTooLarge(_))
    ));
}

#[test]
fn container_roundtrip_recovers_planes() {
    let width = 64;
    let height = 32;
    let rgb = gradient_rgb(width, height);
    let planes = planes_from_rgb(width, height, &rgb).expect("planes");
    let container =
        encode_planes(&planes, width, height, DEFAULT_INTERLEAVE_FACTOR).expect("encode");

    let header = ImageHeader::parse(&container).expect("header");
    assert_eq!(header.width, width);
    assert_eq!(header.height, height);
    assert_eq!(header.container_bytes(), container.len());

    let (decoded_header, decoded) =
        decode_container(&container, DEFAULT_INTERLEAVE_FACTOR).expect("decode");
    assert_eq!(decoded_header, header);
    assert_eq!(decoded, planes);
}

#[test]
fn container_roundtrip_across_interleave_factors() {
    let width = 32;
    let height = 32;
    let rgb = noise_rgb(width, height, 5);
    let planes = planes_from_rgb(width, height, &rgb).expect("planes");
    for &interleave in &[1usize, 2, 4, 24, 32] {
        let container = encode_planes(&planes, width, height, interleave).expect("encode");
        let (_, decoded) = decode_container(&container, interleave).expect("decode");
        assert_eq!(decoded, planes, "interleave {interleave}");
    }
}

#[test]
fn container_length_mismatch_is_rejected() {
    let container = make_container(32, 32, 1);
    let truncated = &container[..container.len() - 1];
    assert!(matches!(
        decode_container(truncated, DEFAULT_INTERLEAVE_FACTOR),
        Err(GtcError::BadContainer(_))
    ));

    let mut padded = container.clone();
    padded.push(0);
    assert!(matches!(
        decode_container(&padded, DEFAULT_INTERLEAVE_FACTOR),
        Err(GtcError::BadContainer(_))
    ));
}

#[test]
fn flipped_payload_bit_is_malformed() {
    let container = make_container(32, 32, 2);
    let header = ImageHeader::parse(&container).expect("header");
    // Middle of the Y stream, past the frequency table and the states.
    let y_payload = HEADER_BYTES + FREQ_TABLE_BYTES + 4 * DEFAULT_INTERLEAVE_FACTOR;
    let offset = y_payload + (header.y_cmp_sz as usize - 4 * DEFAULT_INTERLEAVE_FACTOR) / 2;
    let mut corrupted = container.clone();
    corrupted[offset] ^= 0x20;
    assert!(matches!(
        decode_container(&corrupted, DEFAULT_INTERLEAVE_FACTOR),
        Err(GtcError::MalformedStream(_))
    ));
}

#[test]
fn uniform_block_reconstructs_to_its_color() {
    // One 4x4 block of a flat color: both endpoints coincide and every
    // selector points at c0.
    let rgb = vec![100u8, 180, 60].repeat(16);
    let planes = planes_from_rgb(4, 4, &rgb).expect("planes");
    assert_eq!(planes.palette.len(), 4);
    assert_eq!(planes.indices, vec![0]);

    let header = ImageHeader {
        width: 4,
        height: 4,
        palette_bytes: planes.palette.len() as u64,
        y_cmp_sz: 1,
        chroma_cmp_sz: 1,
        palette_sz: 1,
        indices_sz: 1,
    };
    let mut dxt = vec![0u8; header.dxt_bytes()];
    reconstruct_blocks(&header, &planes, &mut dxt).expect("reconstruct");

    let c0 = u16::from_le_bytes([dxt[0], dxt[1]]);
    let c1 = u16::from_le_bytes([dxt[2], dxt[3]]);
    assert_eq!(c0, c1);
    let selector = u32::from_le_bytes([dxt[4], dxt[5], dxt[6], dxt[7]]);
    assert_eq!(selector, 0);

    let mut out = vec![0u8; header.rgb_bytes()];
    expand_blocks_to_rgb(&header, &dxt, &mut out).expect("expand");
    for pixel in out.chunks_exact(3) {
        // 565 quantization loses the low bits only.
        assert!((i32::from(pixel[0]) - 100).abs() <= 8);
        assert!((i32::from(pixel[1]) - 180).abs() <= 4);
        assert!((i32::from(pixel[2]) - 60).abs() <= 8);
    }
}

#[test]
fn expand_blocks_interpolates_dxt_selectors() {
    let header = ImageHeader {
        width: 4,
        height: 4,
        palette_bytes: 4,
        y_cmp_sz: 1,
        chroma_cmp_sz: 1,
        palette_sz: 1,
        indices_sz: 1,
    };
    // c0 = pure red, c1 = pure blue, one selector code per block row.
    let c0: u16 = 0xf800;
    let c1: u16 = 0x001f;
    let mut selector = 0u32;
    for texel in 0..16 {
        let code = (texel / 4) as u32;
        selector |= code << (2 * texel);
    }
    let mut dxt = Vec::new();
    dxt.extend_from_slice(&c0.to_le_bytes());
    dxt.extend_from_slice(&c1.to_le_bytes());
    dxt.extend_from_slice(&selector.to_le_bytes());

    let mut out = vec![0u8; header.rgb_bytes()];
    expand_blocks_to_rgb(&header, &dxt, &mut out).expect("expand");

    let row = |y: usize| &out[y * 12..y * 12 + 3];
    assert_eq!(row(0), &[255, 0, 0]);
    assert_eq!(row(1), &[0, 0, 255]);
    assert_eq!(row(2), &[170, 0, 85]);
    assert_eq!(row(3), &[85, 0, 170]);
}

#[test]
fn palette_index_out_of_range_is_malformed() {
    let rgb = gradient_rgb(8, 8);
    let mut planes = planes_from_rgb(8, 8, &rgb).expect("planes");
    planes.indices[0] = 200;
    let header = ImageHeader {
        width: 8,
        height: 8,
        palette_bytes: planes.palette.len() as u64,
        y_cmp_sz: 1,
        chroma_cmp_sz: 1,
        palette_sz: 1,
        indices_sz: 1,
    };
    let mut dxt = vec![0u8; header.dxt_bytes()];
    assert!(matches!(
        reconstruct_blocks(&header, &planes, &mut dxt),
        Err(GtcError::MalformedStream(_))
    ));
}

#[test]
fn derived_planes_keep_dxt1_endpoint_order() {
    let rgb = noise_rgb(64, 64, 9);
    let planes = planes_from_rgb(64, 64, &rgb).expect("planes");
    let blocks = 64 * 64 / 16;
    for block in 0..blocks {
        let c0 = {
            let y = planes.y[block];
            let co = planes.chroma[block];
            let cg = planes.chroma[blocks + block];
            ycocg_to_rgb565(y, co, cg)
        };
        let c1 = {
            let y = planes.y[blocks + block];
            let co = planes.chroma[2 * blocks + block];
            let cg = planes.chroma[3 * blocks + block];
            ycocg_to_rgb565(y, co, cg)
        };
        assert!(c0 >= c1, "block {block} violates opaque endpoint order");
        assert!(usize::from(planes.indices[block]) < planes.palette.len() / 4);
    }
}

#[test]
fn options_are_validated() {
    let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
    let bad_page = LoaderOptions {
        page_size: 0,
        ..LoaderOptions::default()
    };
    assert!(matches!(
        BatchDecoder::new(Arc::clone(&backend), bad_page, OutputKind::Dxt),
        Err(GtcError::InvalidOptions(_))
    ));
    let bad_interleave = LoaderOptions {
        interleave_factor: 0,
        ..LoaderOptions::default()
    };
    assert!(matches!(
        BatchDecoder::new(backend, bad_interleave, OutputKind::Dxt),
        Err(GtcError::InvalidOptions(_))
    ));
}

#[test]
fn events_signal_and_wait() {
    let event = Event::new();
    assert!(!event.is_signaled());
    let waiter = event.clone();
    let handle = std::thread::spawn(move || {
        waiter.wait();
        true
    });
    event.signal();
    assert!(handle.join().expect("join"));
    assert!(event.is_signaled());
    Event::wait_all(&[Event::signaled(), event]);
}

#[test]
fn pixel_buffer_acquire_release_protocol() {
    let backend = CpuBackend::new();
    let pixels = backend.create_pixel_buffer(64).expect("buffer");
    let first = backend.acquire_shared(&pixels, &[]).expect("acquire");
    first.wait();
    // Double acquire is an interop violation.
    assert!(matches!(
        backend.acquire_shared(&pixels, &[]),
        Err(GtcError::InteropFailure(_))
    ));
    backend.release_shared(&pixels, &[first]).expect("release");
    // Release without a matching acquire is too.
    assert!(matches!(
        backend.release_shared(&pixels, &[]),
        Err(GtcError::InteropFailure(_))
    ));
}

#[test]
fn bad_container_is_dropped_but_batch_continues() {
    let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
    let good = make_container(32, 32, 3);
    let mut batch =
        BatchDecoder::new(Arc::clone(&backend), LoaderOptions::default(), OutputKind::Dxt)
            .expect("batch");
    assert!(batch.enqueue_image(vec![1, 2, 3]).is_err());
    batch.enqueue_image(good).expect("good container");

    let pixels = backend.create_pixel_buffer(batch.output_bytes()).expect("pixels");
    let report = batch.flush(&pixels).expect("flush");
    assert_eq!(report.outcomes.len(), 2);
    assert!(matches!(
        report.outcomes[0].result,
        Err(GtcError::BadContainer(_))
    ));
    assert!(report.outcomes[1].result.is_ok());
    assert!(report.release_event.is_signaled());
}

#[test]
fn staging_layout_round_trips_through_views() {
    let containers = [make_container(32, 32, 7), make_container(32, 16, 8)];
    let headers: Vec<ImageHeader> = containers
        .iter()
        .map(|c| ImageHeader::parse(c).expect("header"))
        .collect();
    let mut chunk = vec![0u8; page_staging_bytes(&headers)];
    let requests: Vec<(&ImageHeader, &[u8])> = headers
        .iter()
        .zip(containers.iter())
        .map(|(header, container)| (header, container.as_slice()))
        .collect();
    fill_page_staging(&mut chunk, &requests);

    let views = page_request_views(&chunk, &headers).expect("views");
    assert_eq!(views.len(), 2);
    for (view, header) in views.iter().zip(headers.iter()) {
        let planes = decode_request_planes(view, header, DEFAULT_INTERLEAVE_FACTOR)
            .expect("staged decode");
        planes.validate(header.width, header.height).expect("plane sizes");
    }

    // The offset tables at the head of the page mirror the layout.
    let k = headers.len();
    let first_input = read_u32(&chunk, k * PLANES_PER_IMAGE * 4).expect("input offset");
    assert_eq!(first_input, 0);
    let second_output = read_u32(&chunk, 4).expect("output offset");
    assert_eq!(second_output, headers[0].block_count() as u32 * 2);
}
