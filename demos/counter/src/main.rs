use retune_core::*;
use retune_devtools::Inspector;

fn app(count: StateCell<i32>) -> impl Fn() -> anyhow::Result<()> {
    move || {
        let clicks = remember(|| std::cell::Cell::new(0u32))?;
        clicks.set(clicks.get() + 1);

        emit_node("column", || {
            emit_node(format!("Count: {}", count.get()), || Ok(()))?;
            if count.get() % 2 == 0 {
                emit_keyed_node("even", "Even", || Ok(()))?;
            }
            emit_keyed_node("button", "Increment", || Ok(()))?;
            Ok(())
        })?;

        disposable_effect(count.get(), || {
            log::info!("count effect entered");
            on_dispose(|| log::info!("count effect left"))
        })?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let manager = SnapshotManager::global();
    let retuner = Retuner::new(manager);
    let mut inspector = Inspector::new();
    inspector.toggle();

    let count = StateCell::with_manager(manager, 0);
    let root = retuner.create_root(app(count.clone()));
    retuner.tune_now(root)?;
    log::info!("initial patch: {:?}", retuner.take_patch(root));

    for _ in 0..3 {
        // A "click": the write is isolated until the snapshot applies.
        with_mutable_snapshot(manager, || count.update(|c| c + 1))??;
        let passes = retuner.drain_pending()?;
        inspector.after_drain(&retuner, passes);
        for patch in retuner.take_patch(root) {
            log::info!("patch under {:?}: {:?}", patch.parent, patch.ops);
        }
    }

    println!("{}", inspector.dump(&retuner, root));
    retuner.dispose(root);
    Ok(())
}
