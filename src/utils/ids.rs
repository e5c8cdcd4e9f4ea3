use uuid::Uuid;

/// Generates the opaque ids used for executions and computation attempts.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn generate_execution_id(&self) -> String {
        format!("exec_{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn generate_computation_id(&self) -> String {
        format!("comp_{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let ids = IdGenerator::new();
        let a = ids.generate_execution_id();
        let b = ids.generate_execution_id();
        assert!(a.starts_with("exec_"));
        assert_ne!(a, b);
        assert!(ids.generate_computation_id().starts_with("comp_"));
    }
}
