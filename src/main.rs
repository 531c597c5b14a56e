use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use pdl_loader::partition::{ImageSource, PartitionSpec};
use pdl_loader::upload::Progress;
use pdl_loader::{Job, Options, Programmer, Stages};

#[derive(Clone, Debug, StructOpt)]
#[structopt(after_help = "Example:\n\tpdl-loader bootloader:bootloader.bin root:/tmp/ubi.img")]
pub struct Args {
    /// Serial port to connect to
    #[structopt(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// PDL1 binary file to use
    #[structopt(long, default_value = "pdl1.bin")]
    pdl1: PathBuf,

    /// PDL2 binary file to use
    #[structopt(long, default_value = "pdl2.bin")]
    pdl2: PathBuf,

    /// Skip uploading and executing the PDL1 and PDL2 stages
    #[structopt(long, alias = "skippdl")]
    skip_pdl: bool,

    /// Format the entire memory prior to uploading the partitions
    #[structopt(long)]
    format_flash: bool,

    /// <partition_name>:<image_file> pairs to upload
    partitions: Vec<PartitionSpec>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:?}", e);
        std::process::exit(2);
    }

    info!("Done");
}

fn run(o: Args) -> anyhow::Result<()> {
    let stages = if o.skip_pdl {
        None
    } else {
        let stage1 = std::fs::read(&o.pdl1)
            .with_context(|| format!("reading PDL1 image {}", o.pdl1.display()))?;
        let stage2 = std::fs::read(&o.pdl2)
            .with_context(|| format!("reading PDL2 image {}", o.pdl2.display()))?;
        Some(Stages { stage1, stage2 })
    };

    for p in &o.partitions {
        if let ImageSource::File(f) = &p.source {
            let meta = std::fs::metadata(f)
                .with_context(|| format!("reading image {} for partition {}", f.display(), p.name))?;
            info!("Partition {}: {} ({})", p.name, f.display(), bytefmt::format(meta.len()));
        }
    }

    let job = Job {
        stages,
        format_flash: o.format_flash,
        partitions: o.partitions,
    };

    let Args { port, options, .. } = o;

    info!("Opening {}", port);

    let mut p = Programmer::linux(&port, options)
        .with_context(|| format!("connecting to serial port {}", port))?;

    p.on_progress(progress_bars());

    p.run(&job)?;

    Ok(())
}

/// Draw one progress bar per uploaded image
fn progress_bars() -> impl FnMut(&Progress) {
    let mut bars = Bars::default();
    move |pr: &Progress| bars.update(pr)
}

#[derive(Default)]
struct Bars {
    current: Option<ProgressBar>,
}

impl Bars {
    fn update(&mut self, pr: &Progress) {
        // Chunk 0 starts a new upload, labels may repeat across uploads
        if pr.chunk == 0 || self.current.is_none() {
            if let Some(bar) = self.current.take() {
                bar.finish_and_clear();
            }

            let bar = ProgressBar::new(pr.total as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:>12} [{bar:40}] {bytes}/{total_bytes} ({eta})")
                    .progress_chars("=> "),
            );
            bar.set_message(pr.label);
            self.current = Some(bar);
        }

        if let Some(bar) = &self.current {
            bar.set_position(pr.sent as u64);
            if pr.sent >= pr.total {
                bar.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(label: &str, chunk: u32, sent: usize, total: usize) -> Progress<'_> {
        Progress {
            label,
            chunk,
            sent,
            total,
        }
    }

    #[test]
    fn repeated_label_starts_new_bar() {
        let mut bars = Bars::default();

        bars.update(&progress("pdl1", 0, 4096, 5000));
        bars.update(&progress("pdl1", 1, 5000, 5000));
        assert!(bars.current.as_ref().unwrap().is_finished());

        // Partition sharing the stage label
        bars.update(&progress("pdl1", 0, 10, 100));

        let bar = bars.current.as_ref().unwrap();
        assert!(!bar.is_finished());
        assert_eq!(bar.length(), 100);
        assert_eq!(bar.position(), 10);
    }
}
