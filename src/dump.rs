//! JSON snapshot of the runtime's per-thread task state, for profilers
//! and external tooling.

use crate::task::{self, TaskRef, TaskState};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDump {
    pub state: &'static str,
    pub started: bool,
    pub sticky: bool,
    pub tid: i32,
    pub threadpool: i8,
    pub world_age: u64,
    pub is_exception: bool,
    pub stack_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDump {
    pub tid: i32,
    pub current_task: Option<TaskDump>,
    pub root_task: Option<TaskDump>,
}

fn dump_task(t: &TaskRef) -> TaskDump {
    let (_, stack_size, tid) = task::task_stack_buffer(t);
    TaskDump {
        state: match t.state() {
            TaskState::Runnable => "runnable",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        },
        started: t.is_started(),
        sticky: t.sticky(),
        tid,
        threadpool: t.threadpool(),
        world_age: t.world_age(),
        is_exception: t.is_exception(),
        stack_size,
    }
}

/// Serialize this thread's task state.
pub fn dump_runtime() -> String {
    let dump = RuntimeDump {
        tid: task::current_tid(),
        current_task: task::current_task().as_ref().map(dump_task),
        root_task: task::root_task().as_ref().map(dump_task),
    };
    serde_json::to_string(&dump).unwrap()
}
