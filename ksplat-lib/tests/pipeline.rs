use std::time::Duration;

use glam::{Mat4, Vec3};
use ksplat_lib::decoder::SplatFileType;
use ksplat_lib::load::{load_and_encode, load_splat_buffer, AbortHandle, LoadOptions};
use ksplat_lib::ply::parse_ply;
use ksplat_lib::scalar::CompressionLevel;
use ksplat_lib::sort::scheduler::sort_count_for;
use ksplat_lib::sort::{
    DistanceSorter, SortJob, SortParams, SortReply, SortScheduler, SortSchedulerConfig, SortWorker, SorterConfig,
};
use ksplat_lib::splat_buffer::{EncodeOptions, FillRange, ProgressiveOptions, SplatBuffer, SplatBufferGenerator};

const PROPERTIES: [&str; 14] = [
    "x", "y", "z", "f_dc_0", "f_dc_1", "f_dc_2", "opacity", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1",
    "rot_2", "rot_3",
];

/// Binary PLY with `count` splats on a loose spiral.
fn spiral_ply(count: usize) -> Vec<u8> {
    let mut bytes = format!("ply\nformat binary_little_endian 1.0\nelement vertex {}\n", count).into_bytes();
    for name in PROPERTIES {
        bytes.extend_from_slice(format!("property float {}\n", name).as_bytes());
    }
    bytes.extend_from_slice(b"end_header\n");
    for i in 0..count {
        let t = i as f32 * 0.37;
        let rotation = if i % 2 == 0 { [1.0, 0.0, 0.0, 0.0] } else { [0.0, 0.0, 1.0, 0.0] };
        let row = [
            3.0 * t.cos(),
            (i % 17) as f32 * 0.25 - 2.0,
            3.0 * t.sin() - 4.0,
            (i % 5) as f32 * 0.3 - 0.6,
            0.2,
            -0.4,
            2.0,
            -2.0,
            -1.5,
            -3.0,
            rotation[0],
            rotation[1],
            rotation[2],
            rotation[3],
        ];
        for value in row {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

fn encode(bytes: &[u8], level: CompressionLevel) -> SplatBuffer {
    let array = parse_ply(bytes, 0).unwrap();
    let options = EncodeOptions { compression_level: level, ..Default::default() };
    SplatBufferGenerator::new(options).generate(&[array]).unwrap()
}

fn nearest_center_error(buffer: &SplatBuffer, expected: &[Vec3]) -> f32 {
    (0..buffer.splat_count())
        .map(|i| {
            let center = buffer.get_splat_center(i, None);
            expected.iter().map(|e| e.distance(center)).fold(f32::INFINITY, f32::min)
        })
        .fold(0.0, f32::max)
}

#[test]
fn test_ply_through_every_level() {
    let bytes = spiral_ply(300);
    let source = parse_ply(&bytes, 0).unwrap();
    let expected: Vec<Vec3> = source.iter().map(|s| s.center()).collect();

    let full = encode(&bytes, CompressionLevel::Full);
    assert_eq!(full.splat_count(), 300);
    for (i, e) in expected.iter().enumerate() {
        assert_eq!(full.get_splat_center(i, None), *e);
    }

    let half = encode(&bytes, CompressionLevel::Half);
    assert_eq!(half.splat_count(), 300);
    assert!(nearest_center_error(&half, &expected) <= 5.0 / 32767.0 + 1e-6);

    let quantized = encode(&bytes, CompressionLevel::Quantized);
    assert_eq!(quantized.splat_count(), 300);
    for i in 0..300 {
        let (_, rotation) = quantized.get_splat_scale_and_rotation(i, None, None);
        assert!(rotation.w >= 0.0);
        assert!((rotation.length() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_full_level_conversion_is_idempotent() {
    let full = encode(&spiral_ply(120), CompressionLevel::Full);
    let bytes = full.to_bytes();
    let again = SplatBufferGenerator::new(EncodeOptions::default())
        .generate_bytes(&full.to_uncompressed_arrays())
        .unwrap();
    assert_eq!(again, bytes);
}

#[test]
fn test_progressive_load_then_sort() {
    let bytes = spiral_ply(500);
    let options = LoadOptions {
        file_type: Some(SplatFileType::Ply),
        chunk_size: 4096,
        progressive: ProgressiveOptions { section_size: 128, max_sh_degree: 0 },
        ..Default::default()
    };
    let mut loaded = Vec::new();
    let buffer = load_splat_buffer(bytes.as_slice(), &options, &AbortHandle::new(), |p| loaded.push(p.splats_loaded))
        .unwrap();
    assert!(loaded.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(buffer.splat_count(), 500);
    assert_eq!(buffer.max_section_count(), 4);

    let mut centers = vec![0.0f32; 500 * 3];
    buffer.fill_splat_center_array(&mut centers, FillRange::all(&buffer).unwrap(), None);
    let centers4: Vec<f32> = centers.chunks_exact(3).flat_map(|c| [c[0], c[1], c[2], 1.0]).collect();

    let config = SorterConfig { max_splat_count: 500, integer_sort: false, ..Default::default() };
    let mut sorter = DistanceSorter::new(config).unwrap();
    sorter.set_centers(&centers4, 4).unwrap();
    let indexes: Vec<u32> = (0..500).collect();
    let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0) * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
    let sorted = sorter
        .sort(&SortParams { view_proj, indexes_to_sort: &indexes, render_count: 500, sort_count: 500, precomputed: None })
        .unwrap()
        .to_vec();

    let row = view_proj.row(2).truncate();
    let depths: Vec<f32> = sorted.iter().map(|i| row.dot(buffer.get_splat_center(*i as usize, None))).collect();
    // Entries sharing a histogram bin keep their input order.
    let (min, max) = depths.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), d| (a.min(*d), b.max(*d)));
    let slack = (max - min) / 65535.0 * 2.0;
    assert!(depths.windows(2).all(|w| w[0] <= w[1] + slack));
}

#[test]
fn test_dot_splat_midpoint_rotation_is_guarded() {
    let mut record = [0u8; 32];
    record[12..24].copy_from_slice(&[0.5f32.to_le_bytes(); 3].concat());
    record[24..28].copy_from_slice(&[10, 20, 30, 255]);
    record[28..32].copy_from_slice(&[128; 4]);
    let options = LoadOptions { path_name: Some("one.splat".to_string()), ..Default::default() };
    let buffer = load_splat_buffer(&record[..], &options, &AbortHandle::new(), |_| {}).unwrap();
    let (scale, rotation) = buffer.get_splat_scale_and_rotation(0, None, None);
    assert_eq!(scale, Vec3::splat(0.5));
    assert!(rotation.abs_diff_eq(glam::Quat::IDENTITY, 1e-6));
    assert_eq!(buffer.get_splat_color(0), [10, 20, 30, 255]);
}

#[test]
fn test_reencode_drops_transparent_splats() {
    let mut bytes = Vec::new();
    for alpha in [0u8, 5, 200] {
        let mut record = [0u8; 32];
        record[24..28].copy_from_slice(&[1, 2, 3, alpha]);
        record[28..32].copy_from_slice(&[255, 128, 128, 128]);
        bytes.extend_from_slice(&record);
    }
    let options = LoadOptions { file_type: Some(SplatFileType::Splat), ..Default::default() };
    let encode = EncodeOptions { minimum_alpha: 10.0, ..Default::default() };
    let buffer = load_and_encode(bytes.as_slice(), &options, &encode, &AbortHandle::new()).unwrap();
    assert_eq!(buffer.splat_count(), 1);
    assert_eq!(buffer.get_splat_color(0)[3], 200);
}

#[test]
fn test_scheduler_drives_worker() {
    let depths = [5.0f32, 1.0, 3.0, 2.0, 4.0, 0.5, 6.0, 2.5];
    let centers: Vec<f32> = depths.iter().flat_map(|z| [0.0, 0.0, *z, 1.0]).collect();
    let mut worker = SortWorker::spawn().unwrap();
    worker.init(SorterConfig { max_splat_count: depths.len(), ..Default::default() }).unwrap();
    worker.upload_centers(centers, None).unwrap();

    let mut scheduler = SortScheduler::new(SortSchedulerConfig::default());
    scheduler.update(Vec3::ZERO, Vec3::NEG_Z, false);
    let fractions: Vec<f32> = std::iter::from_fn(|| scheduler.update(Vec3::ZERO, Vec3::X, false)).collect();
    assert_eq!(fractions.last(), Some(&1.0));

    let render_count = depths.len();
    for fraction in &fractions {
        worker
            .request_sort(SortJob {
                view_proj: Mat4::IDENTITY,
                indexes_to_sort: (0..render_count as u32).collect(),
                render_count,
                sort_count: sort_count_for(*fraction, render_count),
                precomputed: None,
            })
            .unwrap();
    }

    let mut last = None;
    while let Some(reply) = worker.wait(Duration::from_secs(5)).unwrap() {
        if let SortReply::SortDone { sorted_indexes, sort_count, .. } = reply {
            last = Some((sorted_indexes, sort_count));
            if worker.queued_sorts() == 0 && !worker.is_sort_in_flight() {
                break;
            }
        }
    }
    let (sorted, sort_count) = last.unwrap();
    assert_eq!(sort_count, render_count);
    assert_eq!(sorted, vec![5, 1, 3, 7, 2, 4, 0, 6]);
}
