use crate::{CollectiveContext, CollectiveError, check_recv_len};

/// Single-worker collective: every gather returns the caller's own buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackCollective;

impl LoopbackCollective {
    pub const fn new() -> Self {
        Self
    }
}

impl CollectiveContext for LoopbackCollective {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_gather(&self, send_buf: &[f32], recv_buf: &mut [f32]) -> Result<(), CollectiveError> {
        check_recv_len(send_buf.len(), recv_buf.len(), 1)?;
        recv_buf.copy_from_slice(send_buf);
        Ok(())
    }

    fn all_gather_u64(
        &self,
        send_buf: &[u64],
        recv_buf: &mut [u64],
    ) -> Result<(), CollectiveError> {
        check_recv_len(send_buf.len(), recv_buf.len(), 1)?;
        recv_buf.copy_from_slice(send_buf);
        Ok(())
    }
}
