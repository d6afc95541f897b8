use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::process;
use std::thread;
use std::time::Duration;

use shmem_channels::{ChannelLayer, LayerConfig};

use tempfile::tempdir;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PRODUCERS: usize = 3;
const MESSAGES_PER_PRODUCER: usize = 50;
const GROUP: &str = "simulation";

type SimResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

fn producer(config: LayerConfig, id: usize) -> SimResult<usize> {
    // Every worker attaches on its own, like a separate process would.
    let layer = ChannelLayer::new(&config)?;
    let mut sent = 0;
    for i in 0..MESSAGES_PER_PRODUCER {
        let payload = format!("producer-{}-message-{}", id, i);
        loop {
            match layer.send("work", payload.as_bytes()) {
                Ok(()) => break,
                Err(e) if e.is_full() => thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(e.into()),
            }
        }
        sent += 1;
    }
    let refused = layer.send_group(GROUP, format!("producer-{} done", id).as_bytes())?;
    if !refused.is_empty() {
        warn!(id, ?refused, "group members refused the done notice");
    }
    Ok(sent)
}

fn consumer(config: LayerConfig, expected: usize) -> SimResult<HashSet<String>> {
    let layer = ChannelLayer::new(&config)?;
    let inbox = layer.new_channel("consumer.?")?;
    layer.group_add(GROUP, &inbox)?;
    info!(%inbox, "consumer joined group");

    let mut received = HashSet::new();
    let mut done = 0;
    while received.len() < expected || done < PRODUCERS {
        let message = layer
            .receive_timeout(&["work", inbox.as_str()], Duration::from_secs(5))?
            .ok_or("consumer timed out waiting for messages")?;
        let text = String::from_utf8(message.payload)?;
        if message.channel == inbox {
            info!(notice = %text, "producer finished");
            done += 1;
        } else if !received.insert(text.clone()) {
            return Err(format!("duplicate delivery of {}", text).into());
        }
    }
    layer.group_discard(GROUP, &inbox)?;
    Ok(received)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    info!("starting shmem channel simulation");

    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("simulation.toml");
    fs::write(
        &config_path,
        format!(
            "prefix = \"shmch-sim-{}\"\n\
             channel_memory = 262144\n\
             group_memory = 65536\n\
             message_slot_size = 1024\n\
             capacity = 20\n",
            process::id()
        ),
    )?;
    let config = LayerConfig::load(&config_path)?;
    let layer = ChannelLayer::new(&config)?;

    let consumer_thread = {
        let config = config.clone();
        thread::spawn(move || consumer(config, PRODUCERS * MESSAGES_PER_PRODUCER))
    };
    // Give the consumer time to join before the done notices go out.
    while layer.group_channels(GROUP)?.is_empty() {
        thread::sleep(Duration::from_millis(5));
    }

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let config = config.clone();
            thread::spawn(move || producer(config, id))
        })
        .collect();

    let mut sent = 0;
    for handle in producers {
        sent += handle.join().map_err(|_| "producer panicked")??;
    }
    let received = consumer_thread.join().map_err(|_| "consumer panicked")?;

    let outcome = received.and_then(|received| {
        if received.len() == sent {
            info!(sent, "all messages received exactly once");
            Ok(())
        } else {
            error!(sent, received = received.len(), "message count mismatch");
            Err("simulation failed".into())
        }
    });
    layer.destroy();
    outcome
}
