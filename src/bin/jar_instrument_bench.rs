//! Instruments every class of a JAR the way the agent would, and reports
//! throughput and the classes it had to leave alone.
//!
//! ```bash
//! cargo run --release --features bench-tools --bin jar_instrument_bench -- app.jar [count|timing]
//! ```

use std::env;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use delver::metrics::{MetricsStore, ProbeMode};
use delver::policy::PatternPolicy;
use delver::transformer::ClassTransformer;
use zip::ZipArchive;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let jar_path = args.next().ok_or("usage: jar_instrument_bench JAR_PATH [count|timing]")?;
    let mode = match args.next() {
        Some(value) => ProbeMode::parse(&value).ok_or_else(|| format!("unknown mode {value}"))?,
        None => ProbeMode::Timing,
    };

    let policy = PatternPolicy::new([".*"], Vec::<String>::new())?;
    let transformer = ClassTransformer::new(Some(Arc::new(policy)), Arc::new(MetricsStore::new()), mode);

    let mut zip = ZipArchive::new(File::open(&jar_path)?)?;

    let mut class_files: u64 = 0;
    let mut rewritten: u64 = 0;
    let mut failed: Vec<String> = Vec::new();
    let mut bytes_in: u64 = 0;
    let mut bytes_out: u64 = 0;
    let mut elapsed = Duration::ZERO;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(class_name) = entry.name().strip_suffix(".class").map(str::to_string) else {
            continue;
        };
        if class_name.ends_with("module-info") || class_name.ends_with("package-info") {
            continue;
        }
        class_files += 1;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        bytes_in += bytes.len() as u64;

        let start = Instant::now();
        let outcome = transformer.rewrite(&class_name, &bytes);
        elapsed += start.elapsed();

        match outcome {
            Ok(out) => {
                rewritten += 1;
                bytes_out += out.len() as u64;
            }
            Err(e) => failed.push(format!("{class_name}: {e}")),
        }
    }

    let secs = elapsed.as_secs_f64();
    let mb = bytes_in as f64 / (1024.0 * 1024.0);
    let growth = if bytes_in > 0 { bytes_out as f64 / bytes_in as f64 } else { 0.0 };
    let us_per = if rewritten > 0 { elapsed.as_micros() as f64 / rewritten as f64 } else { 0.0 };

    println!("jar_path={jar_path}");
    println!("mode={mode:?}");
    println!("class_files={class_files}");
    println!("rewritten={rewritten} failed={}", failed.len());
    println!("methods_registered={}", transformer.store().len());
    println!("total_mb={mb:.3}");
    println!("rewrite_time_ms={:.3}", secs * 1000.0);
    println!("us_per_class={us_per:.1}");
    println!("size_growth={growth:.3}");
    for failure in failed.iter().take(20) {
        println!("failed: {failure}");
    }
    Ok(())
}
