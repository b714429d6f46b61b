//! Control channel envelope shared with the controller.

use serde::{Deserialize, Serialize};

use crate::engine::task::{RunResult, TestCase};

/// First byte of the 3-byte frame that ends a file transfer.
pub const FILE_FINISH_MARKER: u8 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Hardware = 0,
    Task = 1,
    Start = 2,
    RunResult = 3,
    Stop = 4,
    Status = 5,
    FileStart = 6,
    FileFinish = 7,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Hardware,
            1 => Self::Task,
            2 => Self::Start,
            3 => Self::RunResult,
            4 => Self::Stop,
            5 => Self::Status,
            6 => Self::FileStart,
            7 => Self::FileFinish,
            other => return Err(format!("unknown message type {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WorkerStatus {
    #[default]
    Idle = 0,
    Ready = 1,
    Working = 2,
    Finished = 3,
    Down = 4,
    FileReady = 5,
}

impl From<WorkerStatus> for u8 {
    fn from(s: WorkerStatus) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for WorkerStatus {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Working,
            3 => Self::Finished,
            4 => Self::Down,
            5 => Self::FileReady,
            other => return Err(format!("unknown worker status {other}")),
        })
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Finished => "finished",
            Self::Down => "down",
            Self::FileReady => "file ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_result: Option<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_num: Option<u32>,
}

impl Message {
    pub fn new(kind: MessageType, status: WorkerStatus) -> Self {
        Self {
            status,
            kind,
            test_case: None,
            run_result: None,
            cpu_num: None,
        }
    }

    /// First message on every connection.
    pub fn hardware(cpu_num: usize) -> Self {
        Self {
            cpu_num: Some(cpu_num as u32),
            ..Self::new(MessageType::Hardware, WorkerStatus::Idle)
        }
    }

    pub fn status(status: WorkerStatus) -> Self {
        Self::new(MessageType::Status, status)
    }

    pub fn run_result(result: RunResult) -> Self {
        Self {
            run_result: Some(result),
            ..Self::new(MessageType::RunResult, WorkerStatus::Working)
        }
    }

    pub fn task(test_case: TestCase) -> Self {
        Self {
            test_case: Some(test_case),
            ..Self::new(MessageType::Task, WorkerStatus::Idle)
        }
    }
}

/// True for the frame that terminates file mode.
pub fn is_file_finish(frame: &[u8]) -> bool {
    frame.len() == 3 && frame[0] == FILE_FINISH_MARKER
}
