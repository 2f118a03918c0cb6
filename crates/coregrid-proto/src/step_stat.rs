//! Step statistics response: a step's accounting aggregate plus its pids.

use coregrid_core::{JobAcct, JobId};

use crate::acct::{decode_acct, encode_acct};
use crate::error::ProtoResult;
use crate::header::{Message, MessageType};
use crate::pack::{Packer, Unpacker};
use crate::version::ProtocolVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatResponse {
    pub job_id: JobId,
    pub step_id: u32,
    pub return_code: u32,
    pub num_tasks: u32,
    pub acct: Option<JobAcct>,
    pub pids: Vec<u32>,
}

impl Message for StepStatResponse {
    const TYPE: MessageType = MessageType::StepStatResponse;

    fn encode(&self, version: ProtocolVersion, p: &mut Packer) {
        p.u32(self.job_id);
        p.u32(self.step_id);
        p.u32(self.return_code);
        p.u32(self.num_tasks);
        encode_acct(self.acct.as_ref(), version, p);
        p.u32_array(&self.pids);
    }

    fn decode(version: ProtocolVersion, u: &mut Unpacker) -> ProtoResult<Self> {
        Ok(Self {
            job_id: u.u32("job_id")?,
            step_id: u.u32("step_id")?,
            return_code: u.u32("return_code")?,
            num_tasks: u.u32("num_tasks")?,
            acct: decode_acct(version, u)?,
            pids: u.u32_array("pids")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderFlags, frame, unframe};
    use coregrid_core::TresId;
    use coregrid_core::tres::{TRES_CPU, TRES_STATIC_CNT};

    #[test]
    fn response_with_and_without_acct() {
        let mut acct = JobAcct::new((0..TRES_STATIC_CNT as TresId).collect());
        acct.set_in_sample(TRES_CPU as TresId, 1500);
        let mut resp = StepStatResponse {
            job_id: 9,
            step_id: 1,
            return_code: 0,
            num_tasks: 2,
            acct: Some(acct),
            pids: vec![400, 401],
        };
        let (_, decoded) =
            unframe::<StepStatResponse>(frame(&resp, ProtocolVersion::CURRENT, HeaderFlags::NONE).unwrap()).unwrap();
        assert_eq!(decoded, resp);

        resp.acct = None;
        let (_, decoded) =
            unframe::<StepStatResponse>(frame(&resp, ProtocolVersion::TWO_BACK, HeaderFlags::NONE).unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }
}
