//! Model checked interleavings.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Thread counts are kept at two and every thread does one or two operations,
//! the state space is exponential. Threads that spin on a transition in
//! progress get a model of their own. Pools are pre-allocated before
//! any thread is spawned, so the growth mutex is never contended inside the
//! model.

#[cfg(test)]
mod tests {
    use crate::{
        lifecycle::{AssetLifecycle, AssetState, LoadOutcome, UnloadOutcome},
        list::NonBlockingList,
        pool::{ObjectPool, PoolConfig},
        store::GlobalStore,
        sync::atomic::{AtomicU32, AtomicUsize, Ordering},
        test_utils::{TransitionLedger, slot},
    };
    use loom::sync::Arc;
    use mutex::raw_impls::cs::CriticalSectionRawMutex;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    struct Fixture {
        list: NonBlockingList,
        table: Vec<AtomicU32>,
    }

    impl Fixture {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                list: NonBlockingList::new(),
                table: (0..len).map(|_| AtomicU32::new(0)).collect(),
            })
        }

        fn drain(&self) -> Vec<u32> {
            let mut out = Vec::new();
            while let Some(s) = self.list.pop_first(&self.table[..]) {
                out.push(s.get());
            }
            out.sort_unstable();
            out
        }
    }

    #[test]
    fn concurrent_prepends_keep_every_slot() {
        bounded(3).check(|| {
            let fx = Fixture::new(3);
            fx.list.prepend(&fx.table[..], slot(0));

            let t1 = {
                let fx = fx.clone();
                loom::thread::spawn(move || fx.list.prepend(&fx.table[..], slot(1)))
            };
            let t2 = {
                let fx = fx.clone();
                loom::thread::spawn(move || fx.list.prepend(&fx.table[..], slot(2)))
            };
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(fx.drain(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn concurrent_pops_never_share_a_slot() {
        bounded(3).check(|| {
            let fx = Fixture::new(3);
            fx.list.extend(&fx.table[..], [slot(0), slot(1), slot(2)]);

            let spawn_pop = |fx: &Arc<Fixture>| {
                let fx = fx.clone();
                loom::thread::spawn(move || fx.list.pop_first(&fx.table[..]).map(|s| s.get()))
            };
            let t1 = spawn_pop(&fx);
            let t2 = spawn_pop(&fx);
            let a = t1.join().unwrap().unwrap();
            let b = t2.join().unwrap().unwrap();
            assert_ne!(a, b);

            let mut all = fx.drain();
            all.extend([a, b]);
            all.sort_unstable();
            assert_eq!(all, vec![0, 1, 2]);
        });
    }

    /// A prepend racing a pop may help unlink the popped head. The popper
    /// must still get exactly one slot and nothing may be lost.
    #[test]
    fn pop_and_prepend_conserve_slots() {
        bounded(3).check(|| {
            let fx = Fixture::new(3);
            fx.list.extend(&fx.table[..], [slot(0), slot(1)]);

            let popper = {
                let fx = fx.clone();
                loom::thread::spawn(move || fx.list.pop_first(&fx.table[..]).map(|s| s.get()))
            };
            let pusher = {
                let fx = fx.clone();
                loom::thread::spawn(move || fx.list.prepend(&fx.table[..], slot(2)))
            };
            let popped = popper.join().unwrap().unwrap();
            pusher.join().unwrap();

            let mut all = fx.drain();
            assert_eq!(all.len(), 2);
            all.push(popped);
            all.sort_unstable();
            assert_eq!(all, vec![0, 1, 2]);
        });
    }

    #[test]
    fn pool_items_are_never_shared() {
        bounded(2).check(|| {
            let pool: Arc<ObjectPool<usize, CriticalSectionRawMutex>> = Arc::new(
                ObjectPool::with_config(GlobalStore, PoolConfig::new().with_capacity(2)).unwrap(),
            );
            let owners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (1..=2usize)
                .map(|me| {
                    let pool = pool.clone();
                    let owners = owners.clone();
                    loom::thread::spawn(move || {
                        let mut item = pool.create().unwrap();
                        owners.fetch_add(1, Ordering::AcqRel);
                        item.write(me);
                        loom::thread::yield_now();
                        // SAFETY: written just above
                        assert_eq!(unsafe { *item.assume_init_ref() }, me);
                        owners.fetch_sub(1, Ordering::AcqRel);
                        pool.destroy(item);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(owners.load(Ordering::Acquire), 0);
            assert_eq!(pool.allocated(), 2);
        });
    }

    #[test]
    fn racing_loads_complete_once() {
        bounded(3).check(|| {
            let asset = Arc::new(AssetLifecycle::new());
            let ledger = Arc::new(TransitionLedger::new());

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let asset = asset.clone();
                    let ledger = ledger.clone();
                    loom::thread::spawn(move || asset.load(|| ledger.enter_load()))
                })
                .collect();
            let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let completed = outcomes.iter().filter(|o| **o == LoadOutcome::Completed).count();
            assert_eq!(completed, 1);
            assert_eq!(ledger.completed_loads(), 1);
            assert_eq!(asset.current_state(), AssetState::Unreferenced);
        });
    }

    /// Each side effect runs at most once and loads and unloads alternate,
    /// whoever wins the race.
    #[test]
    fn load_and_unload_alternate() {
        bounded(2).check(|| {
            let asset = Arc::new(AssetLifecycle::new());
            let ledger = Arc::new(TransitionLedger::new());

            let loader = {
                let (asset, ledger) = (asset.clone(), ledger.clone());
                loom::thread::spawn(move || asset.load(|| ledger.enter_load()))
            };
            let unloader = {
                let (asset, ledger) = (asset.clone(), ledger.clone());
                loom::thread::spawn(move || asset.unload(|| ledger.enter_unload()))
            };
            assert_eq!(loader.join().unwrap(), LoadOutcome::Completed);
            let unloaded = unloader.join().unwrap();

            assert_eq!(ledger.completed_loads(), 1);
            match (unloaded, asset.current_state()) {
                (UnloadOutcome::Skipped, AssetState::Unreferenced) => {
                    assert_eq!(ledger.balance(), 1)
                }
                (UnloadOutcome::Completed, AssetState::Unloaded) => {
                    assert_eq!(ledger.balance(), 0)
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        });
    }

    /// A holder arriving while the asset loads waits for the load, and its
    /// reference is counted against the loaded asset.
    #[test]
    fn references_wait_for_load() {
        bounded(2).check(|| {
            let asset = Arc::new(AssetLifecycle::new());
            let ledger = Arc::new(TransitionLedger::new());

            let loader = {
                let (asset, ledger) = (asset.clone(), ledger.clone());
                loom::thread::spawn(move || asset.load(|| ledger.enter_load()))
            };
            let holder = {
                let asset = asset.clone();
                loom::thread::spawn(move || {
                    asset.add_reference();
                    let seen = asset.current_state();
                    asset.remove_reference();
                    seen
                })
            };
            assert_eq!(loader.join().unwrap(), LoadOutcome::Completed);
            let seen = holder.join().unwrap();

            // Either the reference was taken on the loaded asset, or it was
            // dropped before the load started
            assert!(matches!(
                seen,
                AssetState::Unloaded
                    | AssetState::Loading
                    | AssetState::Unreferenced
                    | AssetState::Referenced(1)
            ));
            assert_eq!(asset.current_state(), AssetState::Unreferenced);
            assert_eq!(ledger.completed_loads(), 1);
        });
    }

    /// A referenced asset is never unloaded, and a reference taken after the
    /// unload started is dropped without touching the count.
    #[test]
    fn unload_respects_references() {
        bounded(2).check(|| {
            let asset = Arc::new(AssetLifecycle::new());
            let ledger = Arc::new(TransitionLedger::new());
            assert_eq!(asset.load(|| ledger.enter_load()), LoadOutcome::Completed);

            let unloader = {
                let (asset, ledger) = (asset.clone(), ledger.clone());
                loom::thread::spawn(move || asset.unload(|| ledger.enter_unload()))
            };
            let holder = {
                let asset = asset.clone();
                loom::thread::spawn(move || {
                    asset.add_reference();
                    asset.remove_reference();
                })
            };
            let unloaded = unloader.join().unwrap();
            holder.join().unwrap();

            match (unloaded, asset.current_state()) {
                (UnloadOutcome::Skipped, AssetState::Unreferenced) => {
                    assert_eq!(ledger.completed_unloads(), 0)
                }
                (UnloadOutcome::Completed, AssetState::Unloaded) => {
                    assert_eq!(ledger.completed_unloads(), 1)
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            assert!(ledger.balance() <= 1);
        });
    }
}
