//! Allocation-info request.
//!
//! The current release sends only the job id. Older releases also carry
//! an optional requesting cluster name; it is dropped when talking to a
//! current peer.

use coregrid_core::JobId;

use crate::error::ProtoResult;
use crate::header::{Message, MessageType};
use crate::pack::{Packer, Unpacker};
use crate::version::ProtocolVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocInfoRequest {
    pub job_id: JobId,
    pub req_cluster: Option<String>,
}

impl AllocInfoRequest {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            req_cluster: None,
        }
    }
}

impl Message for AllocInfoRequest {
    const TYPE: MessageType = MessageType::JobAllocInfo;

    fn encode(&self, version: ProtocolVersion, p: &mut Packer) {
        p.u32(self.job_id);
        if version < ProtocolVersion::CURRENT {
            p.opt_str(self.req_cluster.as_deref());
        }
    }

    fn decode(version: ProtocolVersion, u: &mut Unpacker) -> ProtoResult<Self> {
        let job_id = u.u32("job_id")?;
        let req_cluster = if version < ProtocolVersion::CURRENT {
            u.opt_str("req_cluster")?
        } else {
            None
        };
        Ok(Self { job_id, req_cluster })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderFlags, frame, unframe};

    #[test]
    fn current_release_sends_only_the_job_id() {
        let req = AllocInfoRequest {
            job_id: 77,
            req_cluster: Some("east".to_string()),
        };
        let bytes = frame(&req, ProtocolVersion::CURRENT, HeaderFlags::NONE).unwrap();
        let (header, decoded) = unframe::<AllocInfoRequest>(bytes).unwrap();
        assert_eq!(header.body_length, 4);
        assert_eq!(decoded, AllocInfoRequest::new(77));
    }

    #[test]
    fn previous_release_keeps_the_cluster() {
        let req = AllocInfoRequest {
            job_id: 77,
            req_cluster: Some("east".to_string()),
        };
        for v in [ProtocolVersion::PREVIOUS, ProtocolVersion::TWO_BACK] {
            let (_, decoded) = unframe::<AllocInfoRequest>(frame(&req, v, HeaderFlags::NONE).unwrap()).unwrap();
            assert_eq!(decoded, req);
        }
        let absent = AllocInfoRequest::new(5);
        let (_, decoded) =
            unframe::<AllocInfoRequest>(frame(&absent, ProtocolVersion::PREVIOUS, HeaderFlags::NONE).unwrap()).unwrap();
        assert_eq!(decoded.req_cluster, None);
    }
}
