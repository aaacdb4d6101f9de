use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

const LABEL_TYPE: &str = "type";

pub(crate) const TYPE_PROCESSED: &str = "processed";
pub(crate) const TYPE_ALLOWED: &str = "allowed";
pub(crate) const TYPE_DENIED: &str = "denied";
pub(crate) const TYPE_MUTATED: &str = "mutated";
pub(crate) const TYPE_ERROR: &str = "error";

/// Counts admission requests by outcome on a single counter with a `type`
/// label.
#[derive(Clone, Debug)]
pub struct Metrics {
    requests: Family<Vec<(String, String)>, Counter>,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<Vec<(String, String)>, Counter>::default();
        reg.register(
            "requests",
            "The accumulated total number of admission requests processed",
            requests.clone(),
        );

        let metrics = Self { requests };
        // Publish every label value from the start so rates over the counters
        // are well-defined.
        for ty in [
            TYPE_PROCESSED,
            TYPE_ALLOWED,
            TYPE_DENIED,
            TYPE_MUTATED,
            TYPE_ERROR,
        ] {
            metrics.counter(ty);
        }
        metrics
    }

    fn counter(&self, ty: &str) -> Counter {
        self.requests
            .get_or_create(&vec![(LABEL_TYPE.to_string(), ty.to_string())])
            .clone()
    }

    pub fn incr_processed(&self) {
        self.counter(TYPE_PROCESSED).inc();
    }

    pub fn incr_allowed(&self) {
        self.counter(TYPE_ALLOWED).inc();
    }

    pub fn incr_denied(&self) {
        self.counter(TYPE_DENIED).inc();
    }

    pub fn incr_mutated(&self) {
        self.counter(TYPE_MUTATED).inc();
    }

    pub fn incr_error(&self) {
        self.counter(TYPE_ERROR).inc();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, ty: &str) -> u64 {
        self.counter(ty).get()
    }
}
