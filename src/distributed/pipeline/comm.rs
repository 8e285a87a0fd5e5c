//! Point-to-point transfers between neighbouring pipeline stages.
//!
//! Every micro-batch crosses a stage boundary as a pair: the activation and the
//! running aux-loss total. Each travels on its own tag through the metadata
//! protocol of `comm_utils`, so the aux scalar never shares a buffer with the
//! activation.
//!
//! A metadata transfer occupies two consecutive tags (header, data), so slots
//! are spaced by two:
//!
//! ```text
//! slot = mb_id * 4 + direction * 2 + channel
//! tag  = base + slot * 2
//! ```

use crate::distributed::comm_utils::{recv_tensor_with_metadata, send_tensor_with_metadata};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

/// Which half of a relayed pair a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayChannel {
    Activation = 0,
    AuxLoss = 1,
}

/// Communication tag for one half of a relayed micro-batch.
pub fn relay_tag(mb_id: usize, channel: RelayChannel, is_backward: bool, base: u32) -> Result<u32> {
    let overflow = || Error::DistributedError {
        reason: format!("micro-batch id {mb_id} overflows tag range"),
    };
    let slot = mb_id
        .checked_mul(4)
        .and_then(|v| v.checked_add(if is_backward { 2 } else { 0 }))
        .and_then(|v| v.checked_add(channel as usize))
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(overflow)?;
    let slot = u32::try_from(slot).map_err(|_| overflow())?;
    base.checked_add(slot).ok_or_else(overflow)
}

/// Send `(activation, aux)` for one micro-batch to `dest`.
///
/// Forward transfers carry the stage output and the running aux total.
/// Backward transfers carry the gradients with respect to both.
pub fn send_relay<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    activation: &Tensor<R>,
    aux: &Tensor<R>,
    dest: usize,
    mb_id: usize,
    is_backward: bool,
) -> Result<()> {
    let activation = activation.contiguous();
    let aux = aux.contiguous();
    let act_tag = relay_tag(mb_id, RelayChannel::Activation, is_backward, 0)?;
    send_tensor_with_metadata(comm, &activation, dest, act_tag)?;
    let aux_tag = relay_tag(mb_id, RelayChannel::AuxLoss, is_backward, 0)?;
    send_tensor_with_metadata(comm, &aux, dest, aux_tag)?;
    tracing::trace!(dest, micro_batch = mb_id, is_backward, "relay sent");
    Ok(())
}

/// Receive the `(activation, aux)` pair sent by [`send_relay`].
pub fn recv_relay<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    src: usize,
    mb_id: usize,
    is_backward: bool,
    device: &R::Device,
) -> Result<(Tensor<R>, Tensor<R>)> {
    let act_tag = relay_tag(mb_id, RelayChannel::Activation, is_backward, 0)?;
    let activation = recv_tensor_with_metadata::<R>(comm, src, act_tag, device)?;
    let aux_tag = relay_tag(mb_id, RelayChannel::AuxLoss, is_backward, 0)?;
    let aux = recv_tensor_with_metadata::<R>(comm, src, aux_tag, device)?;
    if aux.numel() != 1 {
        return Err(Error::DistributedError {
            reason: format!(
                "aux relay from rank {src} for micro-batch {mb_id} has shape {:?}",
                aux.shape()
            ),
        });
    }
    tracing::trace!(src, micro_batch = mb_id, is_backward, "relay received");
    Ok((activation, aux))
}
