//! Multi-process training over NCCL.
//!
//! One process per GPU. The processes share nothing but collectives: the
//! ranks exchange an NCCL id through a file, then synchronize gradients
//! and reporting scalars with all-reduce. Everything the orchestrator
//! needs to know about its place in the group travels in an explicit
//! [`DistributedContext`] instead of ambient environment state.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};

#[cfg(feature = "nccl")]
use cudarc::driver::safe::{CudaContext, CudaStream};
#[cfg(feature = "nccl")]
use cudarc::nccl::safe::{Comm, Id};
#[cfg(feature = "nccl")]
use std::sync::Arc;

/// How to join a training group.
#[derive(Debug, Clone)]
pub struct DistributedOptions {
    /// This process's rank, 0 to world_size - 1.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// File used to exchange the NCCL unique id.
    pub comm_file: PathBuf,
    /// CUDA device ordinal this rank binds to.
    pub gpu_id: usize,
}

/// A process's place in the training group plus the communicator, if the
/// group has more than one member. Single-process contexts answer every
/// collective with the identity.
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    comm: Option<NcclCommunicator>,
}

// The communicator wraps raw NCCL handles, so this stays handwritten.
impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("distributed", &self.comm.is_some())
            .finish()
    }
}

impl DistributedContext {
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            comm: None,
        }
    }

    pub fn new(options: &DistributedOptions) -> Result<Self> {
        if options.world_size <= 1 {
            return Ok(Self::single_process());
        }
        anyhow::ensure!(
            options.rank < options.world_size,
            "rank {} out of range for world size {}",
            options.rank,
            options.world_size
        );
        let comm = NcclCommunicator::new(options)?;
        Ok(Self {
            rank: options.rank,
            world_size: options.world_size,
            comm: Some(comm),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 writes checkpoints and logs; everyone else stays quiet.
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.comm.is_some()
    }

    /// Mean of the tensor across ranks; identity when single-process.
    pub fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        match &self.comm {
            Some(comm) => comm.all_reduce_mean(tensor),
            None => Ok(tensor.clone()),
        }
    }

    /// Mean of a host-side scalar across ranks.
    pub fn all_reduce_mean_scalar(&self, value: f32) -> Result<f32> {
        match &self.comm {
            Some(comm) => {
                let tensor = Tensor::from_slice(&[value], 1, &Device::Cpu)?;
                let reduced = comm.all_reduce_mean(&tensor)?;
                Ok(reduced.to_vec1::<f32>()?[0])
            }
            None => Ok(value),
        }
    }

    /// Replaces every gradient in the store with its cross-rank mean.
    /// The vars must arrive in the same order on every rank; pass the
    /// sorted list from [`crate::optim::named_vars_sorted`].
    pub fn sync_gradients(&self, vars: &[(String, Var)], grads: &mut GradStore) -> Result<()> {
        let Some(comm) = &self.comm else {
            return Ok(());
        };
        for (_, var) in vars {
            let tensor = var.as_tensor();
            let reduced = match grads.get(tensor) {
                Some(grad) => comm.all_reduce_mean(grad)?,
                None => continue,
            };
            grads.insert(tensor, reduced);
        }
        Ok(())
    }

    pub fn barrier(&self) -> Result<()> {
        match &self.comm {
            Some(comm) => comm.barrier(),
            None => Ok(()),
        }
    }

    /// Final barrier, then releases the communicator.
    pub fn shutdown(self) -> Result<()> {
        if let Some(comm) = self.comm {
            comm.barrier()?;
            drop(comm);
        }
        Ok(())
    }
}

/// NCCL communicator. The ranks rendezvous through `comm_file`: rank 0
/// writes the NCCL id there (atomically, via rename) and the rest poll
/// until it appears.
#[cfg(feature = "nccl")]
pub struct NcclCommunicator {
    comm: Comm,
    stream: Arc<CudaStream>,
    world_size: usize,
}

#[cfg(feature = "nccl")]
impl NcclCommunicator {
    pub fn new(options: &DistributedOptions) -> Result<Self> {
        use std::io::Write;

        let comm_file = &options.comm_file;
        let id = if options.rank == 0 {
            if comm_file.exists() {
                std::fs::remove_file(comm_file)?;
            }
            let id = Id::new().map_err(|e| anyhow::anyhow!("creating NCCL id failed: {e:?}"))?;
            let tmp_file = comm_file.with_extension("tmp");
            let mut file = std::fs::File::create(&tmp_file)?;
            file.write_all(&id.internal().iter().map(|&b| b as u8).collect::<Vec<_>>())?;
            std::fs::rename(&tmp_file, comm_file)?;
            tracing::info!("rank 0 wrote the NCCL id to {}", comm_file.display());
            id
        } else {
            tracing::info!("rank {} waiting for the NCCL id file", options.rank);
            while !comm_file.exists() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            // Give the rename a moment to settle before reading.
            std::thread::sleep(std::time::Duration::from_millis(100));
            let data = std::fs::read(comm_file)?;
            let internal: [i8; 128] = data
                .into_iter()
                .map(|b| b as i8)
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| anyhow::anyhow!("malformed NCCL id file"))?;
            Id::uninit(internal)
        };

        let ctx = CudaContext::new(options.gpu_id)
            .map_err(|e| anyhow::anyhow!("opening CUDA device {} failed: {e:?}", options.gpu_id))?;
        let stream = ctx.default_stream();
        let comm = Comm::from_rank(stream.clone(), options.rank, options.world_size, id)
            .map_err(|e| anyhow::anyhow!("creating NCCL communicator failed: {:?}", e.0))?;

        // Rank 0 removes the id file once the group has had time to read it.
        if options.rank == 0 {
            std::thread::sleep(std::time::Duration::from_secs(2));
            if comm_file.exists() {
                let _ = std::fs::remove_file(comm_file);
            }
        }
        tracing::info!("rank {} joined the NCCL group", options.rank);

        Ok(Self {
            comm,
            stream,
            world_size: options.world_size,
        })
    }

    pub fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        let summed = self.all_reduce_sum(tensor)?;
        Ok(summed.affine(1.0 / self.world_size as f64, 0.0)?)
    }

    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        use candle_core::DType;
        use cudarc::nccl::safe::ReduceOp;

        let dtype = tensor.dtype();
        let data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        let gpu_data = self
            .stream
            .clone_htod(&data)
            .map_err(|e| anyhow::anyhow!("copying to the GPU failed: {e:?}"))?;
        let mut gpu_output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(|e| anyhow::anyhow!("allocating a GPU buffer failed: {e:?}"))?;
        self.comm
            .all_reduce(&gpu_data, &mut gpu_output, &ReduceOp::Sum)
            .map_err(|e| anyhow::anyhow!("NCCL all-reduce failed: {:?}", e.0))?;
        let output = self
            .stream
            .clone_dtoh(&gpu_output)
            .map_err(|e| anyhow::anyhow!("copying from the GPU failed: {e:?}"))?;

        let result = Tensor::from_vec(output, tensor.shape(), tensor.device())?;
        Ok(result.to_dtype(dtype)?)
    }

    /// A one-element all-reduce standing in for a barrier.
    pub fn barrier(&self) -> Result<()> {
        use cudarc::nccl::safe::ReduceOp;

        let dummy = [0.0f32];
        let gpu_dummy = self
            .stream
            .clone_htod(&dummy)
            .map_err(|e| anyhow::anyhow!("copying to the GPU failed: {e:?}"))?;
        let mut gpu_output = self
            .stream
            .alloc_zeros::<f32>(1)
            .map_err(|e| anyhow::anyhow!("allocating a GPU buffer failed: {e:?}"))?;
        self.comm
            .all_reduce(&gpu_dummy, &mut gpu_output, &ReduceOp::Sum)
            .map_err(|e| anyhow::anyhow!("NCCL barrier failed: {:?}", e.0))?;
        Ok(())
    }
}

/// Stub for builds without NCCL; joining a group of more than one
/// process fails up front.
#[cfg(not(feature = "nccl"))]
pub struct NcclCommunicator {}

#[cfg(not(feature = "nccl"))]
impl NcclCommunicator {
    pub fn new(_options: &DistributedOptions) -> Result<Self> {
        anyhow::bail!("multi-process training needs the nccl feature; rebuild with --features nccl")
    }

    pub fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    pub fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_single_process_identity() -> Result<()> {
        let ctx = DistributedContext::single_process();
        assert!(ctx.is_master());
        assert!(!ctx.is_distributed());
        assert_eq!(ctx.world_size(), 1);

        let tensor = Tensor::from_slice(&[1f32, 2.0, 3.0], 3, &Device::Cpu)?;
        let reduced = ctx.all_reduce_mean(&tensor)?;
        assert_eq!(reduced.to_vec1::<f32>()?, vec![1.0, 2.0, 3.0]);
        assert_eq!(ctx.all_reduce_mean_scalar(0.5)?, 0.5);
        ctx.barrier()?;
        Ok(())
    }

    #[test]
    fn test_world_size_one_never_builds_a_communicator() -> Result<()> {
        let options = DistributedOptions {
            rank: 0,
            world_size: 1,
            comm_file: PathBuf::from("/tmp/unused"),
            gpu_id: 0,
        };
        let ctx = DistributedContext::new(&options)?;
        assert!(!ctx.is_distributed());
        ctx.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_out_of_range_rank_rejected() {
        let options = DistributedOptions {
            rank: 3,
            world_size: 2,
            comm_file: PathBuf::from("/tmp/unused"),
            gpu_id: 0,
        };
        let err = DistributedContext::new(&options).unwrap_err().to_string();
        assert!(err.contains('3'), "missing rank in {err}");
        assert!(err.contains('2'), "missing world size in {err}");
    }

    #[test]
    fn test_single_process_sync_leaves_gradients_alone() -> Result<()> {
        let ctx = DistributedContext::single_process();
        let var = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let loss = (var.as_tensor() * 2.0)?.sum_all()?;
        let mut grads = loss.backward()?;
        let vars = vec![("v".to_string(), var.clone())];

        ctx.sync_gradients(&vars, &mut grads)?;
        let grad = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>()?;
        assert_eq!(grad, vec![2.0, 2.0]);
        Ok(())
    }
}
