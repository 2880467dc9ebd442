//! Tessera Probe
//!
//! Initialises a backend headlessly, prints what the device supports and runs
//! the end-to-end upload, render pass and ray tracing scenarios against it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--backend <soft|vulkan>`: Backend to probe (default: soft)
//! - `--unified`: Put uploads on the graphics queue family
//! - `--no-ray-tracing`: Skip acceleration structures and the ray scenario
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `TESSERA_SPIRV_DIR`: Directory with `copy.spv`, `probe_ray.spv` and `read_target.spv`, required by `--backend vulkan`

use anyhow::{bail, Context};
use tessera_core::{DeviceCapabilities, SampledAssetImageFormat};
use tessera_soft::SoftApi;
use tessera_test::{
    asset_upload_readback, cleared_attachment_readback, compacted_triangle_probe, Harness,
    HarnessConfig, ScenarioBackend,
};
use tessera_vk::VkApi;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Soft,
    Vulkan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Options {
    backend: Backend,
    config: HarnessConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: Backend::Soft,
            config: HarnessConfig::default(),
        }
    }
}

fn print_help() {
    println!("Tessera Probe");
    println!();
    println!("Usage: tessera-probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("      --backend <soft|vulkan>  Backend to probe (default: soft)");
    println!("      --unified                Put uploads on the graphics queue family");
    println!("      --no-ray-tracing         Skip the ray tracing scenario");
    println!("  -h, --help                   Show this help message");
}

/// Parse arguments, excluding the program name. `None` means help was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = args.next().context("--backend needs a value")?;
                options.backend = match value.as_str() {
                    "soft" | "software" => Backend::Soft,
                    "vulkan" | "vk" => Backend::Vulkan,
                    other => bail!("unknown backend `{other}`"),
                };
            }
            "--unified" => options.config = options.config.unified(),
            "--no-ray-tracing" => options.config = options.config.ray_tracing(false),
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown argument `{other}`, see --help"),
        }
    }
    Ok(Some(options))
}

fn print_capabilities(caps: &DeviceCapabilities) {
    println!("Backend:                {}", caps.backend);
    println!("Device:                 {}", caps.device_name);
    println!("Ray tracing:            {}", caps.ray_tracing);
    println!("Dedicated upload queue: {}", caps.dedicated_upload_queue);
    println!(
        "Texture compression:    BC {} / ASTC {}",
        caps.texture_compression_bc, caps.texture_compression_astc
    );
    println!(
        "Alignments:             uniform {} / storage {} / staging {} (row pitch {}) / scratch {}",
        caps.uniform_buffer_offset_alignment,
        caps.storage_buffer_offset_alignment,
        caps.staging_buffer_offset_alignment,
        caps.staging_buffer_row_pitch_alignment,
        caps.scratch_offset_alignment
    );
    let formats: Vec<String> = SampledAssetImageFormat::ALL
        .iter()
        .filter(|format| caps.supports_format(**format))
        .map(|format| format!("{format:?}"))
        .collect();
    println!("Sampled asset formats:  {}", formats.join(", "));
    println!(
        "Depth formats:          {:?} / {:?} with stencil",
        caps.depth_attachment_format, caps.depth_stencil_attachment_format
    );
}

fn run<A: ScenarioBackend>(config: HarnessConfig) -> anyhow::Result<()> {
    let harness = Harness::<A>::new(config).context("failed to initialise backend")?;
    print_capabilities(harness.capabilities());
    println!("Queue topology:         {:?}", harness.topology());
    println!();

    let upload = asset_upload_readback(&harness).context("asset upload scenario failed")?;
    println!("[ok] asset upload: {} bytes read back intact", upload.bytes);

    let clear = cleared_attachment_readback(&harness).context("render pass scenario failed")?;
    println!(
        "[ok] render pass clear: {} texels sampled as {:#010x}",
        clear.texels, clear.word
    );

    if harness.capabilities().ray_tracing {
        let probe = compacted_triangle_probe(&harness).context("ray tracing scenario failed")?;
        println!(
            "[ok] compacted triangle: {} -> {} bytes, hit instance {} at t = {:.3}",
            probe.non_compacted_size, probe.compacted_size, probe.hit.instance_id, probe.hit.t
        );
    } else {
        println!("[skip] compacted triangle: ray tracing disabled");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let Some(options) = parse_args(std::env::args().skip(1))? else {
        print_help();
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!(?options, "Tessera Probe");

    match options.backend {
        Backend::Soft => run::<SoftApi>(options.config),
        Backend::Vulkan => run::<VkApi>(options.config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Option<Options>> {
        parse_args(args.iter().map(ToString::to_string))
    }

    #[test]
    fn defaults_to_dedicated_software_with_ray_tracing() {
        assert_eq!(parse(&[]).unwrap(), Some(Options::default()));
    }

    #[test]
    fn flags_adjust_the_harness_config() {
        let options = parse(&["--backend", "vulkan", "--unified", "--no-ray-tracing"])
            .unwrap()
            .unwrap();
        assert_eq!(options.backend, Backend::Vulkan);
        assert!(!options.config.dedicated_upload_queue);
        assert!(!options.config.ray_tracing);
    }

    #[test]
    fn help_and_bad_input() {
        assert_eq!(parse(&["-h"]).unwrap(), None);
        assert!(parse(&["--backend"]).is_err());
        assert!(parse(&["--backend", "metal"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
    }

    #[test]
    fn software_scenarios_pass() {
        run::<SoftApi>(HarnessConfig::default()).unwrap();
        run::<SoftApi>(HarnessConfig::default().unified().ray_tracing(false)).unwrap();
    }
}
