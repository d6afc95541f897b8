use std::error::Error;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shmem_channels::{ChannelLayer, LayerConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmem-channels.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "1000000")]
    messages: usize,
    #[clap(short = 's', long = "size", default_value = "64")]
    size: usize,
    /// Leave the regions in place after the run.
    #[clap(long)]
    keep: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let cfg = LayerConfig::load(&opts.config)?;
    let layer = ChannelLayer::new(&cfg)?;
    info!(%layer, messages = opts.messages, size = opts.size, "starting benchmark");
    let result = run(&layer, &opts);
    if !opts.keep {
        layer.destroy();
    }
    result
}

#[inline]
fn per_second(count: usize, elapsed: Duration) -> u64 {
    ((count as f64) / elapsed.as_secs_f64().max(f64::EPSILON) / 1000f64) as u64
}

fn run(layer: &ChannelLayer, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let channel = layer.new_channel("bench.?")?;
    let receive_from = [channel.as_str()];
    // Whole batches stay under the channel capacity so no send is refused.
    let batch = layer.capacity_for(&channel).max(1);
    let payload = vec![0x5a_u8; opts.size];

    let mut send_time = Duration::ZERO;
    let mut receive_time = Duration::ZERO;
    let mut done = 0usize;
    while done < opts.messages {
        let n = batch.min(opts.messages - done);

        let start = Instant::now();
        for _ in 0..n {
            layer.send(&channel, &payload)?;
        }
        send_time += start.elapsed();

        let start = Instant::now();
        for _ in 0..n {
            if layer.receive(&receive_from, false)?.is_none() {
                return Err(format!("message lost after {} ops", done).into());
            }
        }
        receive_time += start.elapsed();

        done += n;
        if done % 100_000 < n {
            eprint!("\rTotal {} ops", done);
        }
    }
    println!(
        "\n{:#?}K messages sent/s, {:#?}K received/s. Total time: {:#?}",
        per_second(done, send_time),
        per_second(done, receive_time),
        send_time + receive_time
    );
    Ok(())
}
