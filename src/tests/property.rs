//! Property-based tests for verifying kernel invariants.

#[cfg(test)]
mod property_tests {
    use crate::mem::{MemoryPoolId, MEMORY_OVERHEAD, PARTITION_OVERHEAD};
    use crate::sched::PriorityBitmap;
    use crate::tests::helpers::{entries, log, region, TestEnvironment, TestKernel};
    use crate::thread::{TaskBuilder, TaskId};
    use crate::wait::SuspendPolicy;
    use alloc::collections::BTreeSet;
    use alloc::vec::Vec;
    use core::ptr::NonNull;

    /// Simple linear congruential generator for property testing.
    struct SimpleRng {
        state: u64,
    }

    impl SimpleRng {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.state
        }

        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            min + (self.next_u64() >> 33) % (max - min)
        }

        fn gen_bool(&mut self) -> bool {
            (self.next_u64() >> 32) & 1 == 0
        }
    }

    #[test]
    fn property_bitmap_tracks_highest_ready_priority() {
        let mut rng = SimpleRng::new(0x12345678);
        let mut bitmap = PriorityBitmap::new();
        let mut model = BTreeSet::new();

        for _ in 0..4000 {
            let priority = rng.gen_range(0, 256) as u8;
            if rng.gen_bool() {
                bitmap.mark_ready(priority);
                model.insert(priority);
            } else {
                bitmap.mark_not_ready(priority);
                model.remove(&priority);
            }
            assert_eq!(bitmap.highest_ready(), model.iter().next().copied());
            assert_eq!(bitmap.is_ready(priority), model.contains(&priority));
            if let Some(&highest) = model.iter().next() {
                assert_eq!(bitmap.highest_ready_index(), usize::from(highest));
            }
        }
    }

    /// Every byte of a pool is either usable free space, usable allocated
    /// space or a header.
    fn assert_reconciles(kernel: &TestKernel, pool: MemoryPoolId) {
        let info = kernel.memory_pool_info(pool).unwrap();
        let audit = kernel.audit_memory_pool(pool).unwrap();
        assert_eq!(audit.free_bytes, info.available);
        assert_eq!(audit.free_blocks, info.free_blocks);
        assert_eq!(
            info.size,
            audit.free_bytes
                + audit.allocated_bytes
                + MEMORY_OVERHEAD * (audit.free_blocks + audit.allocated_blocks + audit.regions)
        );
    }

    #[test]
    fn property_memory_pool_accounting_reconciles() {
        let mut rng = SimpleRng::new(0xDEADBEEF);
        let env = TestEnvironment::new();
        let kernel = env.kernel;
        let pool = kernel
            .create_memory_pool("fuzz", region(16 * 1024), 16, SuspendPolicy::Fifo)
            .unwrap();
        let initial = kernel.memory_pool_info(pool).unwrap().available;
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for step in 0..2000 {
            if live.is_empty() || rng.gen_range(0, 3) != 0 {
                let size = rng.gen_range(1, 400) as usize;
                let align = 1usize << rng.gen_range(3, 8);
                if let Ok(ptr) = kernel.try_allocate_aligned_memory(pool, size, align) {
                    assert_eq!(ptr.as_ptr() as usize % align, 0, "step {}", step);
                    let usable = kernel.allocation_size(ptr).unwrap();
                    assert!(usable >= size);
                    live.push((ptr, usable));
                }
            } else {
                let index = rng.gen_range(0, live.len() as u64) as usize;
                let (ptr, _) = live.swap_remove(index);
                kernel.deallocate_memory(ptr).unwrap();
            }
            assert_reconciles(kernel, pool);
            assert_eq!(kernel.audit_memory_pool(pool).unwrap().allocated_blocks, live.len());
        }

        let mut spans: Vec<(usize, usize)> = live
            .iter()
            .map(|&(ptr, usable)| (ptr.as_ptr() as usize, usable))
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "allocations overlap");
        }

        for (ptr, _) in live.drain(..) {
            kernel.deallocate_memory(ptr).unwrap();
        }
        let info = kernel.memory_pool_info(pool).unwrap();
        assert_eq!(info.available, initial);
        assert_eq!(info.free_blocks, 1);
    }

    #[test]
    fn property_partition_pool_conserves_partitions() {
        let mut rng = SimpleRng::new(0xC0FFEE);
        let env = TestEnvironment::new();
        let kernel = env.kernel;
        let count = 12;
        let pool = kernel
            .create_partition_pool("fuzz", region(count * (40 + PARTITION_OVERHEAD)), 40, SuspendPolicy::Fifo)
            .unwrap();
        let mut held: Vec<NonNull<u8>> = Vec::new();

        for _ in 0..1000 {
            if rng.gen_bool() {
                match kernel.try_allocate_partition(pool) {
                    Ok(ptr) => {
                        assert!(!held.contains(&ptr));
                        held.push(ptr);
                    }
                    Err(_) => assert_eq!(held.len(), count),
                }
            } else if !held.is_empty() {
                let index = rng.gen_range(0, held.len() as u64) as usize;
                kernel.deallocate_partition(held.swap_remove(index)).unwrap();
            }
            let info = kernel.partition_pool_info(pool).unwrap();
            assert_eq!(info.allocated, held.len());
            assert_eq!(info.available + info.allocated, info.total);
        }
    }

    #[test]
    fn property_dispatch_follows_priority_then_readiness_order() {
        let mut rng = SimpleRng::new(0xABCDEF);
        let env = TestEnvironment::new();
        let kernel = env.kernel;
        let order = log();
        let mut tasks: Vec<(TaskId, u8)> = Vec::new();
        for index in 0..24 {
            let priority = rng.gen_range(0, 4) as u8 * 10;
            let order = order.clone();
            let id = env.spawn_with(TaskBuilder::new().priority(priority).start_suspended(), async move {
                order.borrow_mut().push(index);
            });
            tasks.push((id, priority));
        }

        // Model: per priority, ready tasks in the order they became ready.
        let mut ready: Vec<Vec<usize>> = (0..4).map(|_| Vec::new()).collect();
        for _ in 0..200 {
            let index = rng.gen_range(0, tasks.len() as u64) as usize;
            let (id, priority) = tasks[index];
            let level = &mut ready[usize::from(priority / 10)];
            if rng.gen_bool() {
                if kernel.resume_task(id).is_ok() {
                    level.push(index);
                }
            } else if !level.contains(&index) {
                assert!(kernel.suspend_task(id).is_ok());
            } else {
                kernel.suspend_task(id).unwrap();
                level.retain(|&other| other != index);
            }
        }

        kernel.run_until_idle();
        let expected: Vec<usize> = ready.into_iter().flatten().collect();
        assert_eq!(entries(&order), expected);
    }
}
