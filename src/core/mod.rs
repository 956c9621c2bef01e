// Domain-layer modules: scoring, selection, pipeline
pub mod scoring {
    pub use crate::scoring::*;
}

pub mod assignment {
    pub use crate::assignment::*;
}

pub mod orchestrator {
    pub use crate::orchestrator::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod validation {
    pub use crate::validation::*;
}
