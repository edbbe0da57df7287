use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on instances of a single stream class.
pub const MAX_STREAM_INSTANCES: u32 = 5;

/// Kind of output a stream carries. Determines the worker name only; every
/// configured stream gets its own ordered delivery lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamClass {
    Raw,
    ZslOutput,
    ZslInput,
    Preview,
    Video,
    Jpeg,
    Callback,
}

impl StreamClass {
    pub const COUNT: u32 = 7;

    pub const ALL: [StreamClass; Self::COUNT as usize] = [
        StreamClass::Raw,
        StreamClass::ZslOutput,
        StreamClass::ZslInput,
        StreamClass::Preview,
        StreamClass::Video,
        StreamClass::Jpeg,
        StreamClass::Callback,
    ];

    fn index(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamClass::Raw => "raw",
            StreamClass::ZslOutput => "zsl-output",
            StreamClass::ZslInput => "zsl-input",
            StreamClass::Preview => "preview",
            StreamClass::Video => "video",
            StreamClass::Jpeg => "jpeg",
            StreamClass::Callback => "callback",
        }
    }
}

/// Stream identifier: `class + instance * StreamClass::COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(class: StreamClass, instance: u32) -> Result<Self> {
        if instance >= MAX_STREAM_INSTANCES {
            return Err(Error::StreamConfig(format!(
                "{} instance {} exceeds the limit of {}",
                class.name(),
                instance,
                MAX_STREAM_INSTANCES
            )));
        }
        Ok(Self(class.index() + instance * StreamClass::COUNT))
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        let instance = raw / StreamClass::COUNT;
        if instance >= MAX_STREAM_INSTANCES {
            return Err(Error::StreamConfig(format!("stream id {raw} is out of range")));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn class(self) -> StreamClass {
        StreamClass::ALL[(self.0 % StreamClass::COUNT) as usize]
    }

    pub fn instance(self) -> u32 {
        self.0 / StreamClass::COUNT
    }
}

impl TryFrom<u32> for StreamId {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Self::from_raw(raw)
    }
}

impl From<StreamId> for u32 {
    fn from(id: StreamId) -> u32 {
        id.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.class().name(), self.instance())
    }
}

/// A stream the session was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub width: u32,
    pub height: u32,
}

impl StreamConfig {
    pub fn new(class: StreamClass, instance: u32, width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            id: StreamId::new(class, instance)?,
            width,
            height,
        })
    }
}

/// Opaque handle of a client-owned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{:x}", self.0)
    }
}

/// A buffer bound to the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBuffer {
    pub stream_id: StreamId,
    pub buffer: BufferHandle,
}

impl StreamBuffer {
    pub fn new(stream_id: StreamId, buffer: BufferHandle) -> Self {
        Self { stream_id, buffer }
    }
}
