use std::{borrow::Cow, io};

use uuid::Uuid;

use crate::{
    Deserialize, Serialize,
    specs::{
        job::{
            CompletionReport, DispatchSpec, FailReason, InferenceSpec, JobId, RoundId,
            TrainingJobId, TrainingSpec,
        },
        status::StatusReport,
        worker::{HeartbeatReport, WorkerDescriptor, WorkerId},
    },
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();
const ID_SIZE: usize = size_of::<Uuid>();

/// The payload data for the `Data` variant of the `Msg` enum.
///
/// Data frames carry the owning entity's id inline so they can arrive in any
/// order relative to their control message.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A worker's model delta for one completed training chunk.
    ChunkDelta { job_id: JobId, delta: &'a [f32] },
    /// A merged checkpoint pushed to workers after aggregation.
    Checkpoint {
        round_id: RoundId,
        params: &'a mut [f32],
    },
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    // worker -> coordinator
    Register(WorkerDescriptor),
    Heartbeat(HeartbeatReport),
    Paused { job_id: JobId, progress_step: u64 },
    Progress { job_id: JobId, step: u64 },
    Completed(CompletionReport),
    Failed { job_id: JobId, reason: FailReason },

    // coordinator -> worker
    RegisterAck { worker_id: WorkerId },
    Dispatch(DispatchSpec),
    Pause { job_id: JobId },
    CheckpointReady { round_id: RoundId, checkpoint_ref: String },
    Drain,
    Disconnect,

    // client -> coordinator
    SubmitInference(InferenceSpec),
    SubmitTraining(TrainingSpec),
    Status,

    // coordinator -> client
    JobAccepted { job_id: JobId },
    TrainingAccepted { training_job_id: TrainingJobId },
    JobDone {
        job_id: JobId,
        status: String,
        result_ref: Option<String>,
    },
    StatusReport(StatusReport),
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: u8) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }

    fn split_id(buf: &mut [u8]) -> io::Result<(Uuid, &mut [u8])> {
        if buf.len() < ID_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Data frame of {} bytes is missing its id prefix", buf.len()),
            ));
        }

        let (id_buf, rest) = buf.split_at_mut(ID_SIZE);

        // SAFETY: We splitted the buffer to be of size `ID_SIZE` just above.
        let id = Uuid::from_bytes((&*id_buf).try_into().unwrap());
        Ok((id, rest))
    }

    fn check_f32_payload(len: usize) -> io::Result<()> {
        if len % size_of::<f32>() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Numeric payload of {len} bytes is not a whole number of f32 values"),
            ));
        }

        Ok(())
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                let header = (0 as Header).to_be_bytes();
                buf.extend_from_slice(&header);
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                let header = (1 as Header).to_be_bytes();
                buf.extend_from_slice(&header);

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, &cmd).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, id, nums) = match payload {
                    Payload::ChunkDelta { job_id, delta } => (2, job_id.0, &**delta),
                    Payload::Checkpoint { round_id, params } => (3, round_id.0, params.as_ref()),
                };

                let header = (kind as Header).to_be_bytes();
                buf.extend_from_slice(&header);
                buf.extend_from_slice(id.as_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes((&*kind_buf).try_into().unwrap()) as u8;

        match kind {
            0 => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            1 => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            2 => {
                let (id, nums) = Self::split_id(rest)?;
                Self::check_f32_payload(nums.len())?;

                Ok(Self::Data(Payload::ChunkDelta {
                    job_id: JobId(id),
                    delta: bytemuck::cast_slice(nums),
                }))
            }
            3 => {
                let (id, nums) = Self::split_id(rest)?;
                Self::check_f32_payload(nums.len())?;

                Ok(Self::Data(Payload::Checkpoint {
                    round_id: RoundId(id),
                    params: bytemuck::cast_slice_mut(nums),
                }))
            }
            byte => Self::invalid_kind_byte(byte),
        }
    }
}
