use std::time::Duration;

use loadplan::{RunSettings, StopHandle, http_sampler, jtl_writer, test_plan, thread_group};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Point this at something you own; 20 users x 100 iterations is plenty
    // to make a small service sweat.
    let plan = test_plan([
        thread_group(
            20,
            100,
            [
                http_sampler("http://localhost:3000/")
                    .label("home")
                    .timeout(Duration::from_secs(5))
                    .into(),
                http_sampler("http://localhost:3000/search?q=rust")
                    .label("search")
                    .timeout(Duration::from_secs(5))
                    .into(),
            ],
        )
        .into(),
        jtl_writer("results.jtl").into(),
    ]);

    // A stop handle lets you cut the run short, e.g. on ctrl-c.
    let (stop, stop_rx) = StopHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let stats = plan
        .run_with(RunSettings::builder().stop(stop_rx).build())
        .await?;

    println!(
        "overall: {} samples, {} errors, min {:?} / mean {:?} / max {:?}",
        stats.overall().samples_count(),
        stats.overall().error_count(),
        stats.overall().min_time(),
        stats.overall().mean_time(),
        stats.overall().max_time(),
    );
    for label in stats.labels() {
        let summary = stats.by_label(label).unwrap();
        println!(
            "{label}: {} samples, mean {:?}",
            summary.samples_count(),
            summary.mean_time()
        );
    }

    Ok(())
}
