//! # Framesync Probe
//!
//! Drives a producer over the synthetic backend and prints what each
//! position resolved to.
//!
//! ```text
//! framesync-probe [--config producer.json] [--frames N] [--positions 0,1,2,40,3]
//!                 [--b-frames] [--live] [--no-audio] [--json]
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use framesync_core::synthetic::{frame_index, SyntheticBackend, SyntheticSource};
use framesync_core::{ImageFormat, Producer, ProducerConfig, ProducerError};

struct ProbeOptions {
    config: Option<String>,
    frames: i64,
    positions: Option<Vec<i64>>,
    b_frames: bool,
    live: bool,
    audio: bool,
    json: bool,
}

impl ProbeOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = Self {
            config: None,
            frames: 100,
            positions: None,
            b_frames: false,
            live: false,
            audio: true,
            json: false,
        };

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => options.config = Some(iter.next().context("--config needs a path")?.clone()),
                "--frames" => {
                    let value = iter.next().context("--frames needs a count")?;
                    options.frames = value.parse().with_context(|| format!("bad frame count {:?}", value))?;
                }
                "--positions" => {
                    let value = iter.next().context("--positions needs a list")?;
                    let positions = value
                        .split(',')
                        .map(|p| p.trim().parse::<i64>())
                        .collect::<Result<Vec<_>, _>>()
                        .with_context(|| format!("bad position list {:?}", value))?;
                    options.positions = Some(positions);
                }
                "--b-frames" => options.b_frames = true,
                "--live" => options.live = true,
                "--no-audio" => options.audio = false,
                "--json" => options.json = true,
                other => bail!("unknown argument {:?}", other),
            }
        }
        Ok(options)
    }

    fn load_config(&self) -> Result<ProducerConfig> {
        match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
                let config = ProducerConfig::from_json(&json).with_context(|| format!("parsing {}", path))?;
                Ok(config.with_env())
            }
            None => Ok(ProducerConfig::from_env()),
        }
    }

    fn source(&self) -> SyntheticSource {
        let mut source = SyntheticSource::video(self.frames);
        if self.audio {
            source = source.with_audio(48_000, 2, 1024);
        }
        if self.b_frames {
            source = source.with_b_frames();
        }
        if self.live {
            source = source.live();
        }
        source
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("framesync_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = ProbeOptions::from_args(&args)?;
    let config = options.load_config()?;
    tracing::info!("Framesync Probe v{}", framesync_core::VERSION);

    let positions = options
        .positions
        .clone()
        .unwrap_or_else(|| (0..options.frames).collect());
    let producer = Producer::new(Arc::new(SyntheticBackend::new(options.source())), "synthetic", config);

    let mut rows = Vec::with_capacity(positions.len());
    for position in positions {
        let video = producer.get_video_output(position, ImageFormat::Native)?;
        let samples = match producer.get_audio_output(position, None, None) {
            Ok(buffer) => Some(buffer.samples),
            Err(ProducerError::NoAudio) => None,
            Err(e) => return Err(e.into()),
        };

        if options.json {
            rows.push(serde_json::json!({
                "position": position,
                "frame_position": video.frame_position,
                "frame": frame_index(&video.image),
                "concealed": video.concealed,
                "samples": samples,
            }));
        } else {
            println!(
                "{:>6} -> frame {:>6} (index {:?}){} audio {:?}",
                position,
                video.frame_position,
                frame_index(&video.image),
                if video.concealed { " concealed" } else { "" },
                samples
            );
        }
    }

    let stats = producer.stats();
    if options.json {
        let summary = serde_json::json!({
            "positions": rows,
            "seeks": stats.seeks,
            "opens": stats.opens,
            "image_cache_hits": stats.image_cache.hits,
            "audio_cache_hits": stats.audio_cache.hits,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "seeks {} opens {} image cache {}/{} audio cache {}/{}",
            stats.seeks,
            stats.opens,
            stats.image_cache.hits,
            stats.image_cache.hits + stats.image_cache.misses,
            stats.audio_cache.hits,
            stats.audio_cache.hits + stats.audio_cache.misses
        );
    }

    producer.close();
    Ok(())
}
