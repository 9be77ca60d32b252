use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Sender;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub mod cli;

use cli::Args;
use handoff::{abort_wait, set_current_task, Channel, PopError, PushError, Queue, TaskHandle};

const QUEUE_SIZE: usize = 4;
const PRODUCER_CHANNEL: Channel = 1;
const CONSUMER_CHANNEL: Channel = 2;
const DONE: &str = "DONE";

type MessageQueue = Queue<Message, QUEUE_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub a: String,
    pub b: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a='{}', b='{}'", self.a, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Consumer,
}

/// One push or pop as seen by the task performing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub role: Role,
    pub seq: usize,
    pub a: String,
    pub b: String,
    pub delay_ms: u64,
    pub wait_us: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let producer = TaskHandle::new("Producer");
    let consumer = TaskHandle::new("Consumer");
    let exit_signal = Arc::new(AtomicBool::new(false));

    let e = exit_signal.clone();
    let tasks = (producer.clone(), consumer.clone());
    ctrlc::set_handler(move || {
        if e.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            std::process::exit(1);
        } else {
            eprintln!("CTRL-C received, stopping tasks (press again to kill)");
            abort_wait(&tasks.0);
            abort_wait(&tasks.1);
        }
    })?;

    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    println!("Seed: {seed}");

    let records = run(&args, seed, &producer, &consumer, &exit_signal)?;

    if let Some(path) = &args.output {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        for record in &records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        println!("Wrote {} records to {}", records.len(), path.display());
    }

    Ok(())
}

/// Runs both tasks to completion and returns what they reported, in the
/// order the main thread received it.
pub fn run(
    args: &Args,
    seed: u64,
    producer: &TaskHandle,
    consumer: &TaskHandle,
    exit_signal: &AtomicBool,
) -> anyhow::Result<Vec<Record>> {
    let queue: MessageQueue = Queue::new(
        producer.clone(),
        PRODUCER_CHANNEL,
        consumer.clone(),
        CONSUMER_CHANNEL,
    )
    .context("creating message queue")?;
    let queue = &queue;

    let (records_tx, records_rx) = crossbeam_channel::unbounded();

    thread::scope(|s| {
        let tx = records_tx.clone();
        let producer_thread = s.spawn(move || {
            let _bound = set_current_task(producer)?;
            let mut rng = StdRng::seed_from_u64(seed);
            produce(args, &mut rng, queue, exit_signal, tx)
        });

        let tx = records_tx;
        let consumer_thread = s.spawn(move || {
            let _bound = set_current_task(consumer)?;
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
            consume(args, &mut rng, queue, exit_signal, tx)
        });

        println!("Waiting for tasks to complete.");
        let mut records = Vec::new();
        for record in records_rx.iter() {
            let verb = match record.role {
                Role::Producer => "pushed",
                Role::Consumer => "popped",
            };
            println!(
                "{verb} #{} a='{}', b='{}' (paused {} ms, blocked {} us)",
                record.seq, record.a, record.b, record.delay_ms, record.wait_us
            );
            records.push(record);
        }

        let pushed = join(producer_thread.join())?;
        println!("Producer DONE after {pushed} pushes.");
        let popped = join(consumer_thread.join())?;
        println!("Consumer DONE after {popped} pops.");
        println!("Queue tasks completed.");
        Ok(records)
    })
}

fn join(result: thread::Result<anyhow::Result<usize>>) -> anyhow::Result<usize> {
    match result {
        Ok(result) => result,
        Err(_) => anyhow::bail!("task thread panicked"),
    }
}

/// Pushes `items` numbered messages, then the DONE sentinel. Returns the
/// number of successful pushes.
fn produce(
    args: &Args,
    rng: &mut StdRng,
    queue: &MessageQueue,
    exit_signal: &AtomicBool,
    records: Sender<Record>,
) -> anyhow::Result<usize> {
    thread::sleep(Duration::from_millis(args.startup_ms));
    let stall = stall_limit(args);

    for seq in 0..=args.items {
        let delay_ms = random_delay(rng, args.producer_delay_ms);
        let message = if seq == args.items {
            Message {
                a: DONE.to_string(),
                b: format!("delay{delay_ms}"),
            }
        } else {
            Message {
                a: seq.to_string(),
                b: format!("delay{delay_ms}"),
            }
        };
        let mut record = Record {
            role: Role::Producer,
            seq,
            a: message.a.clone(),
            b: message.b.clone(),
            delay_ms,
            wait_us: 0,
        };

        let start = Instant::now();
        let mut pending = message;
        loop {
            if exit_signal.load(Ordering::Relaxed) {
                return Ok(seq);
            }
            match queue.push_timeout(pending, stall) {
                Ok(()) => break,
                Err(PushError::Timeout(message)) => {
                    eprintln!(
                        "Producer blocked on a full queue for {} ms",
                        start.elapsed().as_millis()
                    );
                    pending = message;
                }
                Err(PushError::Aborted(_)) => return Ok(seq),
            }
        }
        record.wait_us = start.elapsed().as_micros() as u64;
        records.send(record)?;
    }

    Ok(args.items + 1)
}

/// Pops until the DONE sentinel arrives or the fail-safe count is reached.
/// Returns the number of successful pops.
fn consume(
    args: &Args,
    rng: &mut StdRng,
    queue: &MessageQueue,
    exit_signal: &AtomicBool,
    records: Sender<Record>,
) -> anyhow::Result<usize> {
    thread::sleep(Duration::from_millis(args.startup_ms));
    let stall = stall_limit(args);
    let failsafe = args.items + 6;

    let mut popped = 0;
    while popped < failsafe {
        let delay_ms = random_delay(rng, args.consumer_delay_ms);

        let start = Instant::now();
        let message = loop {
            if exit_signal.load(Ordering::Relaxed) {
                return Ok(popped);
            }
            match queue.pop_timeout(stall) {
                Ok(message) => break message,
                Err(PopError::Timeout) => eprintln!(
                    "Consumer blocked on an empty queue for {} ms",
                    start.elapsed().as_millis()
                ),
                Err(PopError::Aborted) => return Ok(popped),
            }
        };
        let wait_us = start.elapsed().as_micros() as u64;

        let done = message.a == DONE;
        records.send(Record {
            role: Role::Consumer,
            seq: popped,
            a: message.a,
            b: message.b,
            delay_ms,
            wait_us,
        })?;
        popped += 1;
        if done {
            break;
        }
    }

    Ok(popped)
}

/// Without `--stall-warn-ms` a wait only ends by success or abort.
fn stall_limit(args: &Args) -> Duration {
    args.stall_warn_ms.map_or(Duration::MAX, Duration::from_millis)
}

fn random_delay(rng: &mut StdRng, max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let delay = rng.gen_range(1..=max_ms);
    thread::sleep(Duration::from_millis(delay));
    delay
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use clap::Parser;
    use handoff::TaskHandle;

    use super::{run, Args, Message, Record, Role, DONE};

    fn quick_args(items: usize) -> Args {
        Args::parse_from([
            "demo",
            "--items",
            &items.to_string(),
            "--producer-delay-ms",
            "0",
            "--consumer-delay-ms",
            "3",
            "--startup-ms",
            "0",
        ])
    }

    fn of_role(records: &[Record], role: Role) -> Vec<(String, String)> {
        records
            .iter()
            .filter(|r| r.role == role)
            .map(|r| (r.a.clone(), r.b.clone()))
            .collect()
    }

    #[test]
    fn consumer_sees_every_message_in_order() {
        let args = quick_args(12);
        let producer = TaskHandle::new("Producer");
        let consumer = TaskHandle::new("Consumer");
        let records = run(&args, 7, &producer, &consumer, &AtomicBool::new(false)).unwrap();

        let pushed = of_role(&records, Role::Producer);
        let popped = of_role(&records, Role::Consumer);
        assert_eq!(pushed.len(), 13);
        assert_eq!(pushed, popped);
        assert_eq!(popped.last().unwrap().0, DONE);
        let numbers: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        assert_eq!(
            popped[..12].iter().map(|(a, _)| a.clone()).collect::<Vec<_>>(),
            numbers
        );
    }

    #[test]
    fn task_handles_are_reusable_across_runs() {
        let args = quick_args(3);
        let producer = TaskHandle::new("Producer");
        let consumer = TaskHandle::new("Consumer");
        for seed in 0..3 {
            let records = run(&args, seed, &producer, &consumer, &AtomicBool::new(false)).unwrap();
            assert_eq!(records.len(), 8);
        }
    }

    #[test]
    fn preset_exit_stops_both_tasks() {
        let args = quick_args(5);
        let producer = TaskHandle::new("Producer");
        let consumer = TaskHandle::new("Consumer");
        let records = run(&args, 1, &producer, &consumer, &AtomicBool::new(true)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn records_round_trip_through_csv() {
        let record = Record {
            role: Role::Consumer,
            seq: 3,
            a: "3".into(),
            b: "delay17".into(),
            delay_ms: 42,
            wait_us: 1500,
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&record).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("role,seq,a,b,delay_ms,wait_us\nconsumer,3,"));

        let mut reader = csv::Reader::from_reader(&bytes[..]);
        let back: Record = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn message_display() {
        let message = Message {
            a: "abc".into(),
            b: "123".into(),
        };
        assert_eq!(message.to_string(), "a='abc', b='123'");
    }
}
