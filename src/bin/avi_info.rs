//! avi_info - inspect an AVI artifact written by the studio

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;

use detection_studio::{AviSummary, ChannelOrder};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// AVI file to inspect.
    path: PathBuf,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
    /// Extract frame N (1-based) as JPEG to --jpeg.
    #[arg(long, requires = "jpeg")]
    frame: Option<usize>,
    /// Destination of the extracted frame.
    #[arg(long)]
    jpeg: Option<PathBuf>,
}

#[derive(Serialize)]
struct Info {
    codec: String,
    width: u32,
    height: u32,
    frame_rate: f64,
    frames: usize,
    finalized: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let summary = AviSummary::read(&args.path)?;
    let info = Info {
        codec: summary.codec.to_string(),
        width: summary.geometry.width,
        height: summary.geometry.height,
        frame_rate: summary.frame_rate,
        frames: summary.frame_count(),
        finalized: summary.is_finalized(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("file:      {}", args.path.display());
        println!("codec:     {}", info.codec);
        println!("geometry:  {}", summary.geometry);
        println!("fps:       {:.3}", info.frame_rate);
        println!("frames:    {}", info.frames);
        println!("finalized: {}", info.finalized);
    }

    if let (Some(number), Some(out)) = (args.frame, args.jpeg) {
        let index = number
            .checked_sub(1)
            .ok_or_else(|| anyhow!("--frame is 1-based"))?;
        let frame = summary.decode_frame(index)?;
        let image = RgbImage::from_raw(
            frame.width(),
            frame.height(),
            frame.to_order(ChannelOrder::Rgb),
        )
        .ok_or_else(|| anyhow!("decoded frame does not match its geometry"))?;
        let mut file = std::fs::File::create(&out)
            .with_context(|| format!("create {}", out.display()))?;
        JpegEncoder::new_with_quality(&mut file, 90)
            .encode_image(&image)
            .context("encode JPEG")?;
        eprintln!("frame {} written to {}", number, out.display());
    }
    Ok(())
}
