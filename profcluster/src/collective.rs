// Collective operations across the processes (ranks) of a measurement.
//
// Exporting the cluster mapping is the only point where ranks coordinate.  `SingleProcess` is the
// trivial one-rank transport.  `ThreadGroup` runs N ranks as N threads of one process, which is
// what the command line tool uses to export the mapping of several profile dumps.  With the `mpi`
// feature, `MpiWorld` runs the collectives across the processes of an MPI job.
//
// Every operation blocks until all ranks of the group have called it.  There is no timeout.

use std::sync::{Arc, Barrier, Mutex};

#[cfg(feature = "mpi")]
pub use self::mpi_world::MpiWorld;

pub trait Collective {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn allreduce_sum(&self, value: u64) -> u64;
    fn allreduce_max(&self, value: u64) -> u64;

    /// One value from every rank, in rank order, delivered to `root` only.
    fn gather(&self, value: u64, root: usize) -> Option<Vec<u64>>;

    fn barrier(&self);
}

pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, value: u64) -> u64 {
        value
    }

    fn allreduce_max(&self, value: u64) -> u64 {
        value
    }

    fn gather(&self, value: u64, _root: usize) -> Option<Vec<u64>> {
        Some(vec![value])
    }

    fn barrier(&self) {}
}

struct Shared {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<u64>>,
}

pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Create the `size` members of a group, one to be moved into each participating thread.

    pub fn new(size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    // Publish a value and read everyone's.  The second wait keeps a fast rank from overwriting its
    // slot before the slow ones have read it.

    fn exchange(&self, value: u64) -> Vec<u64> {
        self.shared.slots.lock().unwrap_or_else(|e| e.into_inner())[self.rank] = value;
        self.shared.barrier.wait();
        let values = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.shared.barrier.wait();
        values
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn allreduce_sum(&self, value: u64) -> u64 {
        self.exchange(value).iter().sum()
    }

    fn allreduce_max(&self, value: u64) -> u64 {
        self.exchange(value).into_iter().max().unwrap_or(0)
    }

    fn gather(&self, value: u64, root: usize) -> Option<Vec<u64>> {
        let values = self.exchange(value);
        if self.rank == root {
            Some(values)
        } else {
            None
        }
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

#[cfg(feature = "mpi")]
mod mpi_world {
    use super::Collective;
    use anyhow::{bail, Result};
    use mpi::collective::SystemOperation;
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// The processes of MPI_COMM_WORLD.  MPI is finalized when this is dropped.

    pub struct MpiWorld {
        world: SimpleCommunicator,
        _universe: Universe,
    }

    impl MpiWorld {
        /// Initialize MPI.  Fails if MPI was initialized already in this process.

        pub fn initialize() -> Result<MpiWorld> {
            let Some(universe) = mpi::initialize() else {
                bail!("MPI is already initialized");
            };
            Ok(MpiWorld {
                world: universe.world(),
                _universe: universe,
            })
        }

        fn all_reduce(&self, value: u64, op: SystemOperation) -> u64 {
            let mut result = 0u64;
            self.world.all_reduce_into(&value, &mut result, op);
            result
        }
    }

    impl Collective for MpiWorld {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn allreduce_sum(&self, value: u64) -> u64 {
            self.all_reduce(value, SystemOperation::sum())
        }

        fn allreduce_max(&self, value: u64) -> u64 {
            self.all_reduce(value, SystemOperation::max())
        }

        fn gather(&self, value: u64, root: usize) -> Option<Vec<u64>> {
            let root_process = self.world.process_at_rank(root as i32);
            if self.rank() == root {
                let mut values = vec![0u64; self.size()];
                root_process.gather_into_root(&value, &mut values[..]);
                Some(values)
            } else {
                root_process.gather_into(&value);
                None
            }
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }

    // Without mpirun this is a singleton job of one rank.

    #[test]
    fn test_mpi_world() {
        let world = MpiWorld::initialize().unwrap();
        let n = world.size() as u64;
        assert!(world.allreduce_sum(1) == n);
        assert!(world.allreduce_max(world.rank() as u64) == n - 1);
        let gathered = world.gather(7, 0);
        if world.rank() == 0 {
            assert!(gathered == Some(vec![7; n as usize]));
        } else {
            assert!(gathered.is_none());
        }
        world.barrier();
    }
}

#[test]
fn test_single_process() {
    let c = SingleProcess;
    assert!(c.size() == 1);
    assert!(c.allreduce_sum(3) == 3);
    assert!(c.gather(5, 0) == Some(vec![5]));
}

#[test]
fn test_thread_group() {
    let group = ThreadGroup::new(4);
    let results = std::thread::scope(|s| {
        let handles = group
            .into_iter()
            .map(|g| {
                s.spawn(move || {
                    let r = g.rank() as u64;
                    let sum = g.allreduce_sum(r + 1);
                    let max = g.allreduce_max(r * 10);
                    let gathered = g.gather(r * r, 0);
                    g.barrier();
                    (g.rank(), sum, max, gathered)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for (rank, sum, max, gathered) in results {
        assert!(sum == 10);
        assert!(max == 30);
        if rank == 0 {
            assert!(gathered == Some(vec![0, 1, 4, 9]));
        } else {
            assert!(gathered.is_none());
        }
    }
}
