#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProgressPhase {
    Scanning,
    Saving,
    Deferred,
}

#[derive(Clone, Debug)]
pub enum ProgressMessage {
    Started {
        phase: ProgressPhase,
        total: usize,
    },
    Progress {
        phase: ProgressPhase,
        current: usize,
        collection: Option<String>,
    },
    Layer {
        index: usize,
        collections: Vec<String>,
    },
    Finished {
        phase: ProgressPhase,
    },
    Error(String),
}
