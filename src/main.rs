use std::time::Duration;

use zone_rt::host::{EventLoop, EventTarget};
use zone_rt::specs::TaskTracker;
use zone_rt::{EventLoopConfig, Runtime, RuntimeConfig, TaskType, Zone, ZoneResult, ZoneSpec};

/// Fork a zone whose `on_invoke` prints a tag around every callback it runs.
fn tagged(parent: &Zone, tag: &'static str) -> ZoneResult<Zone> {
    parent.fork(
        ZoneSpec::new(tag)
            .with_property("tag", serde_json::json!(tag))
            .on_invoke(move |delegate, _, target, invocation, source| {
                println!("[{tag}] enter {source}");
                let result = delegate.invoke(target, invocation, source);
                println!("[{tag}] leave {source}");
                result
            }),
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let runtime = Runtime::with_config(RuntimeConfig::from_env()?);
    let event_loop = EventLoop::new(&runtime, EventLoopConfig::default())?;
    let button = EventTarget::new(&runtime, "button")?;

    eprintln!("zone-demo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Root zone: {}", runtime.root().name());

    let red = tagged(&runtime.root(), "red")?;
    let blue = tagged(&runtime.root(), "blue")?;

    // Work scheduled in each zone comes back tagged with that zone only.
    for zone in [&red, &blue] {
        let timer_rt = runtime.clone();
        let click_rt = runtime.clone();
        zone.run_with_source("setup", || {
            event_loop.set_timeout(
                move |_| {
                    let current = timer_rt.current();
                    println!("timeout in {} (tag={:?})", current.name(), current.get("tag"));
                    Ok(())
                },
                Duration::from_millis(10),
            )?;
            button.add_event_listener("click", move |payload| {
                let clicks = payload.and_then(|p| p.downcast_ref::<u32>()).copied();
                println!("click {clicks:?} handled in {}", click_rt.current().name());
                Ok(())
            })?;
            Ok(())
        })?;
    }

    button.dispatch("click", &1u32);
    event_loop.advance(Duration::from_millis(10))?;

    let tracker = TaskTracker::new();
    let tracked = red.fork(tracker.zone_spec())?;
    let interval = tracked.run(|| {
        event_loop.set_interval(
            |_| {
                println!("tick");
                Ok(())
            },
            Duration::from_millis(5),
        )
    })?;
    event_loop.advance(Duration::from_millis(12))?;
    eprintln!(
        "   Tracked macro tasks: {}",
        serde_json::to_string(
            &tracker
                .tasks_for(TaskType::MacroTask)
                .iter()
                .map(|t| t.snapshot())
                .collect::<Vec<_>>()
        )?
    );
    event_loop.clear_timer(&interval)?;

    let rt = runtime.clone();
    let name = blue
        .bind_future(async move {
            tokio::task::yield_now().await;
            rt.current().name().to_string()
        })
        .await;
    println!("future resumed in {name}");

    let turns = event_loop.run_until_idle()?;
    tracing::info!(turns, tracked = tracker.len(), "demo finished");
    runtime.shutdown();
    Ok(())
}
