//! Records a small multi-threaded trace and writes it to a file loadable in
//! Perfetto or about:tracing.
//!
//! Usage: nested_spans <output_file>

use quicktrace::{InstantScope, Recorder};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let output_file = if args.len() > 1 {
        &args[1]
    } else {
        eprintln!("Usage: {} <output_file>", args[0]);
        std::process::exit(1);
    };

    let recorder = Recorder::open_path(output_file)?;
    let stats = quicktrace::stats::start(
        &recorder,
        quicktrace::stats::DEFAULT_STATS,
        Duration::from_millis(100),
    )?;

    {
        let _main = recorder.span("main", "app");
        recorder.instant("startup-done", "app", InstantScope::Process);

        let workers: Vec<_> = (0..2)
            .map(|i| {
                let recorder = recorder.clone();
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        for j in 0..5 {
                            let _span = recorder.span(&format!("chunk-{j}"), "worker");
                            std::thread::sleep(Duration::from_millis(20));
                        }
                    })
            })
            .collect();
        for worker in workers {
            worker?.join().expect("worker panicked");
        }
    }

    stats.stop();
    recorder.close()?;
    println!("wrote {output_file}");
    Ok(())
}
