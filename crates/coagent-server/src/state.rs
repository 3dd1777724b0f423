use coagent::Runtime;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Runtime,
}

impl AppState {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }
}
