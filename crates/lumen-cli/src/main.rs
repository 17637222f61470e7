//! Offline/interactive demo driver for the lumen ray tracer.
//!
//! Renders one of the built-in demo scenes (or a JSON scene description)
//! for a number of frames, optionally saving each frame as a numbered
//! PNG. Window/display integration is a separate collaborator; when one
//! hosts this driver it maps W/A/S/D to camera movement, the arrow keys
//! to rotation, F2 to FSAA, F3 to the next camera, F4 to frame capture,
//! F7/F8 to SIMD type/width cycling, F11 to the next demo and ESC to
//! quit.

mod demos;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use lumen_engine::{Fsaa, Scene, SceneOptions, OPT_ALL, OPT_UPDATE};
use lumen_scene::SceneDesc;

/// Window size classes, smallest to largest.
const WINDOW_SIZES: [(u32, u32); 10] = [
    (320, 180),
    (480, 270),
    (640, 360),
    (800, 480),
    (960, 540),
    (1280, 720),
    (1440, 810),
    (1600, 900),
    (1920, 1080),
    (2560, 1440),
];

#[derive(Parser, Debug)]
#[command(
    name = "lumen",
    version,
    about = "CPU ray tracer for analytic surfaces",
    disable_help_flag = true
)]
struct Args {
    /// Demo scene index
    #[arg(short = 'd', default_value_t = 0)]
    demo: usize,

    /// Camera index to start from
    #[arg(short = 'c', default_value_t = 0)]
    camera: usize,

    /// Number of frames to render
    #[arg(short = 'f', default_value_t = 1)]
    frames: u32,

    /// Per-frame time delta in milliseconds
    #[arg(short = 'g', default_value_t = 16)]
    delta: i64,

    /// Starting index for saved images
    #[arg(short = 'i', default_value_t = 0)]
    image_index: u32,

    /// Scene time at the first frame, milliseconds
    #[arg(short = 'b', default_value_t = 0)]
    begin: i64,

    /// Stop once the scene time passes this value (0 = no limit)
    #[arg(short = 'e', default_value_t = 0)]
    end: i64,

    /// SIMD quad factor (packet width = quad * vector size)
    #[arg(short = 'q', default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=8))]
    quad: u32,

    /// SIMD subvariant to prefer
    #[arg(short = 's', default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=8))]
    subvariant: u32,

    /// SIMD vector size in 32-bit lanes
    #[arg(short = 'v', default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=8))]
    vector: u32,

    /// Worker thread count (0 = all cores)
    #[arg(short = 't', default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=1000))]
    threads: u32,

    /// Window size class
    #[arg(short = 'w', default_value_t = 3, value_parser = clap::value_parser!(u32).range(0..=9))]
    window: u32,

    /// Horizontal resolution override
    #[arg(short = 'x', default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=65535))]
    xres: u32,

    /// Vertical resolution override
    #[arg(short = 'y', default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=65535))]
    yres: u32,

    /// FPS log interval in milliseconds
    #[arg(short = 'r', default_value_t = 500)]
    log_interval: u64,

    /// Enable fullscreen anti-aliasing
    #[arg(short = 'a')]
    fsaa: bool,

    /// Log FPS continuously
    #[arg(short = 'l')]
    log_fps: bool,

    /// Save every rendered frame as a numbered PNG
    #[arg(short = 'o')]
    offscreen: bool,

    /// Disable incremental updates (recompute everything per frame)
    #[arg(short = 'u')]
    full_update: bool,

    /// Print engine state after each frame
    #[arg(short = 'h')]
    print_state: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Load a JSON scene description instead of a built-in demo
    #[arg(long)]
    scene: Option<PathBuf>,

    /// Ray bounce budget
    #[arg(long, default_value_t = 3)]
    depth: u32,
}

fn load_scene(args: &Args) -> Result<SceneDesc, String> {
    match &args.scene {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("bad scene json: {e}"))
        }
        None => Ok(demos::demo(args.demo)),
    }
}

fn run(args: &Args) -> Result<(), String> {
    let desc = load_scene(args)?;

    let (mut xres, mut yres) = WINDOW_SIZES[args.window as usize];
    if args.xres > 0 {
        xres = args.xres;
    }
    if args.yres > 0 {
        yres = args.yres;
    }

    let opts = if args.full_update {
        OPT_ALL & !OPT_UPDATE
    } else {
        OPT_ALL
    };
    let mut scene = Scene::new(
        &desc,
        xres,
        yres,
        SceneOptions {
            thnum: args.threads as usize,
            depth: args.depth,
            fsaa: if args.fsaa { Fsaa::X4 } else { Fsaa::No },
            opts,
            simd_width: (args.quad * args.vector) as usize,
            ..SceneOptions::default()
        },
    )
    .map_err(|e| e.to_string())?;

    for _ in 0..args.camera {
        scene.next_cam();
    }
    if args.subvariant > 1 {
        // subvariants cycle through the registered backends in order
        let widths = scene.simd_widths();
        let w = widths[(args.subvariant as usize - 1) % widths.len()];
        scene.set_simd(w).map_err(|e| e.to_string())?;
    }
    log::info!(
        "rendering {}x{yres} at simd width {}, {} frame(s)",
        xres,
        scene.simd_width(),
        args.frames
    );

    let started = Instant::now();
    let mut last_log = Instant::now();
    let mut frames_since_log = 0u32;

    for frame in 0..args.frames {
        let time = args.begin + frame as i64 * args.delta;
        if args.end > 0 && time > args.end {
            break;
        }
        scene.render(time).map_err(|e| e.to_string())?;
        frames_since_log += 1;

        if args.offscreen {
            let path = scene
                .save_frame(args.image_index + frame)
                .map_err(|e| e.to_string())?;
            log::info!("saved {}", path.display());
        }
        if args.print_state {
            scene.print_state();
        }
        if args.log_fps && last_log.elapsed().as_millis() as u64 >= args.log_interval {
            let fps = frames_since_log as f64 / last_log.elapsed().as_secs_f64();
            log::info!("fps: {fps:.1}");
            last_log = Instant::now();
            frames_since_log = 0;
        }
    }

    if !args.offscreen {
        // a single offline run still leaves one image behind
        let path = scene.save_frame(args.image_index).map_err(|e| e.to_string())?;
        log::info!("saved {}", path.display());
    }
    log::info!(
        "rendered {} frame(s) in {:.2}s",
        args.frames,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            log::error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_defaults() {
        let args = Args::parse_from(["lumen"]);
        assert_eq!(args.demo, 0);
        assert_eq!(args.frames, 1);
        assert_eq!(args.window, 3);
        assert_eq!(WINDOW_SIZES[args.window as usize], (800, 480));
    }

    #[test]
    fn test_args_parse_flags() {
        let args = Args::parse_from([
            "lumen", "-d", "1", "-f", "10", "-g", "20", "-t", "4", "-x", "320", "-y", "200",
            "-q", "1", "-v", "8", "-a", "-o",
        ]);
        assert_eq!(args.demo, 1);
        assert_eq!(args.frames, 10);
        assert_eq!(args.delta, 20);
        assert_eq!(args.threads, 4);
        assert_eq!((args.xres, args.yres), (320, 200));
        assert_eq!(args.quad * args.vector, 8);
        assert!(args.fsaa);
        assert!(args.offscreen);
    }

    #[test]
    fn test_args_reject_out_of_range() {
        assert!(Args::try_parse_from(["lumen", "-t", "2000"]).is_err());
        assert!(Args::try_parse_from(["lumen", "-w", "12"]).is_err());
        assert!(Args::try_parse_from(["lumen", "-q", "9"]).is_err());
    }

    #[test]
    fn test_all_demos_build_and_validate() {
        for d in 0..demos::DEMO_COUNT {
            demos::demo(d).validate().unwrap();
        }
    }

    #[test]
    fn test_demo_renders_one_frame() {
        let desc = demos::demo(1);
        let mut scene = Scene::new(
            &desc,
            64,
            40,
            SceneOptions {
                thnum: 1,
                depth: 1,
                ..SceneOptions::default()
            },
        )
        .unwrap();
        scene.render(0).unwrap();
        let frame = scene.get_frame();
        assert!(frame.iter().any(|&p| p != frame[0]));
    }
}
