#[derive(serde::Deserialize)]
struct Record {
    role: String,
    wait_us: u64,
}

#[derive(Default)]
struct Summary {
    count: usize,
    total_us: u64,
    max_us: u64,
    blocked: usize,
}

/// Waits above this are counted as the task having blocked on the queue.
const BLOCKED_US: u64 = 1000;

impl Summary {
    fn add(&mut self, wait_us: u64) {
        self.count += 1;
        self.total_us += wait_us;
        self.max_us = self.max_us.max(wait_us);
        if wait_us > BLOCKED_US {
            self.blocked += 1;
        }
    }

    fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.total_us as f64 / self.count as f64 / 1000.
        }
    }
}

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "analysis/runs/demo.csv".to_string());
    let records = load_csv(&path);

    let mut producer = Summary::default();
    let mut consumer = Summary::default();
    for record in &records {
        match record.role.as_str() {
            "producer" => producer.add(record.wait_us),
            "consumer" => consumer.add(record.wait_us),
            other => eprintln!("skipping record with unknown role '{other}'"),
        }
    }

    println!("--- Summary of {path} ---");
    println!();
    for (name, summary, cause) in [
        ("producer", &producer, "full"),
        ("consumer", &consumer, "empty"),
    ] {
        println!(
            "{name}: {} messages, mean wait {:.02} ms, max wait {:.02} ms",
            summary.count,
            summary.mean_ms(),
            summary.max_us as f64 / 1000.,
        );
        println!(
            "{name}: blocked on a {cause} queue {} times",
            summary.blocked
        );
    }

    println!();
    if producer.count != consumer.count {
        println!(
            "{} messages were pushed but never popped",
            producer.count.saturating_sub(consumer.count)
        );
    } else {
        println!("every pushed message was popped");
    }
}

fn load_csv(path: &str) -> Vec<Record> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let list: Result<Vec<Record>, _> = reader.deserialize().collect();
    list.unwrap()
}
