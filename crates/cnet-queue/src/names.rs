//! Broker key names of a run.

use cnet_core::defaults::{
    COMPLETED_SUFFIX, MEASURE_UPDATE_COUNTER_SUFFIX, MEASURE_UPDATE_QUEUE_SUFFIX,
    POINT_INSERT_COUNTER_SUFFIX, POINT_INSERT_QUEUE_SUFFIX, PROCESSING_SUFFIX, WORKING_SUFFIX,
};
use cnet_core::{Error, Result};

/// The five queues and two counters of a run, all prefixed `<basename>:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub basename: String,
    pub processing: String,
    pub completed: String,
    pub working: String,
    pub point_insert: String,
    pub point_insert_counter: String,
    pub measure_update: String,
    pub measure_update_counter: String,
}

impl QueueNames {
    pub fn new(basename: &str) -> Self {
        let key = |suffix: &str| format!("{}:{}", basename, suffix);
        Self {
            basename: basename.to_string(),
            processing: key(PROCESSING_SUFFIX),
            completed: key(COMPLETED_SUFFIX),
            working: key(WORKING_SUFFIX),
            point_insert: key(POINT_INSERT_QUEUE_SUFFIX),
            point_insert_counter: key(POINT_INSERT_COUNTER_SUFFIX),
            measure_update: key(MEASURE_UPDATE_QUEUE_SUFFIX),
            measure_update_counter: key(MEASURE_UPDATE_COUNTER_SUFFIX),
        }
    }

    /// Every key of the run, lists and counters.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.processing.clone(),
            self.completed.clone(),
            self.working.clone(),
            self.point_insert.clone(),
            self.point_insert_counter.clone(),
            self.measure_update.clone(),
            self.measure_update_counter.clone(),
        ]
    }

    /// Resolve a queue a cluster job may drain by its short name.
    pub fn drainable(&self, name: &str) -> Result<&str> {
        match name {
            "processing" | "processing_queue" => Ok(&self.processing),
            "working" | "working_queue" => Ok(&self.working),
            other => Err(Error::InvalidInput(format!(
                "'{}' is not a drainable queue; valid names are \"processing\" and \"working\"",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_prefixed() {
        let names = QueueNames::new("ctx");
        assert_eq!(names.processing, "ctx:processing");
        assert_eq!(names.completed, "ctx:completed");
        assert_eq!(names.working, "ctx:working");
        assert_eq!(names.point_insert, "ctx:point_insert_queue");
        assert_eq!(names.point_insert_counter, "ctx:point_insert_counter");
        assert_eq!(names.measure_update, "ctx:measure_update_queue");
        assert_eq!(names.measure_update_counter, "ctx:measure_update_counter");
    }

    #[test]
    fn test_all_lists_seven_keys() {
        let all = QueueNames::new("run").all();
        assert_eq!(all.len(), 7);
        assert!(all.iter().all(|k| k.starts_with("run:")));
    }

    #[test]
    fn test_drainable() {
        let names = QueueNames::new("run");
        assert_eq!(names.drainable("processing").unwrap(), "run:processing");
        assert_eq!(names.drainable("working_queue").unwrap(), "run:working");
        assert!(names.drainable("completed").is_err());
    }
}
