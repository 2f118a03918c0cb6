//! Node registration status.

use bytes::Bytes;
use coregrid_core::JobId;

use crate::error::ProtoResult;
use crate::header::{Message, MessageType};
use crate::pack::{Packer, Unpacker};
use crate::version::ProtocolVersion;

/// A step running on the registering node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningStep {
    pub job_id: JobId,
    pub step_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub node_name: String,
    pub cpus: u32,
    /// MiB.
    pub real_memory: u32,
    /// MiB.
    pub tmp_disk: u32,
    pub jobs: Vec<RunningStep>,
    pub status: u32,
    /// Opaque to the controller.
    pub switch_info: Bytes,
}

impl Message for NodeRegistration {
    const TYPE: MessageType = MessageType::NodeRegistrationStatus;

    fn encode(&self, _version: ProtocolVersion, p: &mut Packer) {
        p.i64(self.timestamp);
        p.str(&self.node_name);
        p.u32(self.cpus);
        p.u32(self.real_memory);
        p.u32(self.tmp_disk);
        let job_ids: Vec<u32> = self.jobs.iter().map(|j| j.job_id).collect();
        p.u32_array(&job_ids);
        for job in &self.jobs {
            p.u16(job.step_id);
        }
        p.u32(self.status);
        p.blob(&self.switch_info);
    }

    fn decode(_version: ProtocolVersion, u: &mut Unpacker) -> ProtoResult<Self> {
        let timestamp = u.i64("timestamp")?;
        let node_name = u.str("node_name")?;
        let cpus = u.u32("cpus")?;
        let real_memory = u.u32("real_memory")?;
        let tmp_disk = u.u32("tmp_disk")?;
        let job_ids = u.u32_array("job_ids")?;
        let mut jobs = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            jobs.push(RunningStep {
                job_id,
                step_id: u.u16("step_id")?,
            });
        }
        let status = u.u32("status")?;
        let switch_info = u.blob("switch_info")?;
        Ok(Self {
            timestamp,
            node_name,
            cpus,
            real_memory,
            tmp_disk,
            jobs,
            status,
            switch_info,
        })
    }
}
