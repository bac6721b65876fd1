//! Subtask records and their lifecycle
//!
//! A subtask is one independently executable unit of decomposed work. The
//! records live in the store; this module only defines their shape and the
//! transitions they may go through.

pub mod model;
pub mod state;

pub use model::{
    ParentStatus, ParentTask, Subtask, SubtaskContext, SubtaskId, SubtaskSpec, SubtaskStatus, WorkerId,
};
