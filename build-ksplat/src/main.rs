use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use ksplat_lib::decoder::SplatFileType;
use ksplat_lib::load::{load_and_encode, AbortHandle, LoadOptions};
use ksplat_lib::scalar::CompressionLevel;
use ksplat_lib::splat_buffer::{EncodeOptions, SectionHeader, SplatBuffer, SplatBufferHeader};

#[derive(Clone, Debug, Default)]
struct BuildKsplatOptions {
    encode: EncodeOptions,
    max_sh: Option<usize>,
    info: bool,
}

fn parse_vec3(rest: &str) -> Option<[f32; 3]> {
    let values = rest
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<Result<Vec<f32>, _>>()
        .ok()?;
    values.try_into().ok()
}

fn output_filename(filename: &str, level: CompressionLevel) -> String {
    let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
    if SplatFileType::from_path(filename) == Some(SplatFileType::KSplat) {
        format!("{}-l{}.ksplat", stem, level.as_u16())
    } else {
        format!("{}.ksplat", stem)
    }
}

fn describe(header: &SplatBufferHeader, sections: &[SectionHeader]) -> serde_json::Map<String, serde_json::Value> {
    let mut description = serde_json::Map::new();
    description.insert("header".to_string(), serde_json::to_value(header).unwrap_or_default());
    description.insert("sections".to_string(), serde_json::to_value(sections).unwrap_or_default());
    description
}

fn print_info(filename: &str) -> anyhow::Result<()> {
    let bytes = std::fs::read(filename)?;
    let buffer = SplatBuffer::from_bytes(&bytes)?;
    let sections: Vec<SectionHeader> = buffer.sections().iter().map(|s| s.header().clone()).collect();
    let description = describe(buffer.header(), &sections);
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

fn process_file(filename: &str, options: &BuildKsplatOptions) -> anyhow::Result<()> {
    let file = File::open(filename)?;
    let total_bytes = file.metadata()?.len() as usize;
    let mut load_options = LoadOptions {
        path_name: Some(filename.to_string()),
        total_bytes: Some(total_bytes),
        chunk_size: 1024 * 1024,
        ..Default::default()
    };
    if let Some(max_sh) = options.max_sh {
        load_options.progressive.max_sh_degree = max_sh;
    }

    let buffer = load_and_encode(BufReader::new(file), &load_options, &options.encode, &AbortHandle::new())?;
    println!(
        "Encoded: num_splats: {} in {} sections with sh_degree: {}",
        buffer.splat_count(),
        buffer.section_count(),
        buffer.sh_degree()
    );

    let output = output_filename(filename, options.encode.compression_level);
    let bytes = buffer.to_bytes();
    let mut writer = BufWriter::new(File::create(&output)?);
    writer.write_all(&bytes)?;
    writer.flush()?;
    println!("Wrote {} ({} bytes)", output, bytes.len());
    Ok(())
}

fn show_usage_exit() -> ! {
    eprintln!("Usage: build-ksplat");
    eprintln!("  [--level=<0|1|2>]                 // Compression level (default 0)");
    eprintln!("  [--alpha=<min-alpha>]             // Drop splats with alpha below this, 0..255 (default 1)");
    eprintln!("  [--scene-center=<x>,<y>,<z>]      // Scene center stored in the header");
    eprintln!("  [--block-size=<size>]             // Bucket block size for levels 1 and 2 (default 5)");
    eprintln!("  [--bucket-size=<count>]           // Splats per bucket (default 256)");
    eprintln!("  [--max-sh=<degree>]               // Maximum SH degree kept (default 2)");
    eprintln!("  [--info]                          // Print the headers of .ksplat inputs instead of converting");
    eprintln!("  <file.ply|file.splat|file.ksplat> [...]");
    std::process::exit(1);
}

fn parse_or_exit<T: std::str::FromStr>(flag: &str, rest: &str) -> T {
    match rest.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("Invalid {} value: {}", flag, rest);
            show_usage_exit();
        }
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut options = BuildKsplatOptions::default();
    let mut filenames = Vec::new();

    for arg in args {
        if let Some(rest) = arg.strip_prefix("--level=") {
            match CompressionLevel::from_enum_str(rest) {
                Ok(level) => {
                    println!("Using --level={}", level.as_u16());
                    options.encode.compression_level = level;
                }
                Err(_) => {
                    eprintln!("Invalid --level value: {}", rest);
                    show_usage_exit();
                }
            }
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--alpha=") {
            let alpha: f32 = parse_or_exit("--alpha", rest);
            options.encode.minimum_alpha = alpha.clamp(0.0, 255.0);
            println!("Using --alpha={}", options.encode.minimum_alpha);
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--scene-center=") {
            let Some(center) = parse_vec3(rest) else {
                eprintln!("Invalid --scene-center value: {}", rest);
                show_usage_exit();
            };
            options.encode.scene_center = center;
            println!("Using --scene-center={:?}", center);
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--block-size=") {
            let block_size: f32 = parse_or_exit("--block-size", rest);
            if block_size.is_nan() || block_size <= 0.0 {
                eprintln!("Invalid --block-size value: {}", rest);
                show_usage_exit();
            }
            options.encode.block_size = block_size;
            println!("Using --block-size={}", block_size);
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--bucket-size=") {
            let bucket_size: u32 = parse_or_exit("--bucket-size", rest);
            options.encode.bucket_size = bucket_size.max(1);
            println!("Using --bucket-size={}", options.encode.bucket_size);
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--max-sh=") {
            let max_sh: usize = parse_or_exit("--max-sh", rest);
            println!("Using --max-sh={}", max_sh.min(2));
            options.max_sh = Some(max_sh.min(2));
            continue;
        }
        if arg == "--info" {
            options.info = true;
            continue;
        }
        if arg.starts_with("--") {
            eprintln!("Unknown option: {}", arg);
            show_usage_exit();
        }
        filenames.push(arg);
    }

    if filenames.is_empty() {
        show_usage_exit();
    }

    let mut failed = false;
    for filename in filenames {
        println!("*** Processing: {}", filename);
        let result = if options.info {
            print_info(&filename)
        } else {
            process_file(&filename, &options)
        };
        if let Err(err) = result {
            log::error!("{}: {:#}", filename, err);
            eprintln!("Failed: {}: {}", filename, err);
            failed = true;
        }
    }
    if failed {
        std::process::exit(2);
    }
}
