//! Partition assignment of one log consumer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{PartitionSeeker, RebalanceListener, SeekTo};
use crate::consumer::AssignmentView;
use crate::event::Partition;
use crate::sync::lock;
use crate::topic::{OffsetResetStrategy, Topic};

#[derive(Debug, Default)]
struct State {
    assigned: BTreeSet<i32>,
    /// Partition identities whose reset policy has been applied.
    seeded: HashSet<String>,
    lag: HashMap<i32, u64>,
}

/// Assigned partitions, seeding history and lag of one consumer.
///
/// Rebalance callbacks and the poll loop both go through the one mutex, so
/// the check-then-seek on assignment is atomic with respect to polling. The
/// seeding history outlives reconnects: a partition identity is reset at most
/// once for the lifetime of the consumer.
#[derive(Debug)]
pub struct PartitionAssignment {
    topic: Arc<Topic>,
    state: Mutex<State>,
}

impl PartitionAssignment {
    pub fn new(topic: Arc<Topic>) -> Self {
        Self {
            topic,
            state: Mutex::new(State::default()),
        }
    }

    /// Assigned partition numbers, ascending.
    pub fn assigned(&self) -> Vec<i32> {
        lock(&self.state).assigned.iter().copied().collect()
    }

    pub fn is_seeded(&self, partition: i32) -> bool {
        let id = Partition::new(Arc::clone(&self.topic), partition);
        lock(&self.state).seeded.contains(id.id())
    }

    /// Record freshly fetched lag figures.
    pub fn update_lag(&self, lag: HashMap<i32, u64>) {
        lock(&self.state).lag = lag;
    }

    /// Forget the assignment after the connection closed. Seeding history
    /// is kept.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.assigned.clear();
        state.lag.clear();
    }

    fn seek_target(&self) -> Option<SeekTo> {
        match self.topic.offset_reset_strategy() {
            OffsetResetStrategy::Earliest => Some(SeekTo::Beginning),
            OffsetResetStrategy::Latest => Some(SeekTo::End),
            OffsetResetStrategy::Current => None,
        }
    }
}

impl RebalanceListener for PartitionAssignment {
    fn on_assigned(&self, partitions: &[i32], seeker: &dyn PartitionSeeker) {
        let target = self.seek_target();
        let mut state = lock(&self.state);
        for &value in partitions {
            state.assigned.insert(value);
            let partition = Partition::new(Arc::clone(&self.topic), value);
            if state.seeded.contains(partition.id()) {
                continue;
            }
            match target {
                Some(to) => match seeker.seek(value, to) {
                    Ok(()) => {
                        debug!(partition = %partition, to = ?to, "partition seeded");
                        state.seeded.insert(partition.id().to_string());
                    }
                    Err(e) => {
                        warn!(partition = %partition, error = %e, "seeking newly assigned partition failed");
                    }
                },
                None => {
                    state.seeded.insert(partition.id().to_string());
                }
            }
        }
        info!(topic = %self.topic.name(), partitions = ?partitions, "partitions assigned");
    }

    fn on_revoked(&self, partitions: &[i32]) {
        let mut state = lock(&self.state);
        for value in partitions {
            state.assigned.remove(value);
            state.lag.remove(value);
        }
        info!(topic = %self.topic.name(), partitions = ?partitions, "partitions revoked");
    }

    fn on_lost(&self, partitions: &[i32]) {
        warn!(topic = %self.topic.name(), partitions = ?partitions, "partitions lost");
        self.on_revoked(partitions);
    }
}

impl AssignmentView for PartitionAssignment {
    fn partitions(&self) -> Vec<Partition> {
        self.assigned()
            .into_iter()
            .map(|value| Partition::new(Arc::clone(&self.topic), value))
            .collect()
    }

    fn lag(&self) -> u64 {
        let state = lock(&self.state);
        state
            .assigned
            .iter()
            .filter_map(|p| state.lag.get(p))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerType};
    use crate::error::{Error, Result};

    #[derive(Default)]
    struct RecordingSeeker {
        seeks: Mutex<Vec<(i32, SeekTo)>>,
        fail: bool,
    }

    impl PartitionSeeker for RecordingSeeker {
        fn seek(&self, partition: i32, to: SeekTo) -> Result<()> {
            if self.fail {
                return Err(Error::Backend("not assigned yet".to_string()));
            }
            self.seeks.lock().unwrap().push((partition, to));
            Ok(())
        }
    }

    fn assignment(strategy: OffsetResetStrategy) -> PartitionAssignment {
        let broker = Arc::new(Broker::new(BrokerType::Kafka, "local"));
        PartitionAssignment::new(Arc::new(
            Topic::new(broker, "orders").with_offset_reset_strategy(strategy),
        ))
    }

    #[test]
    fn earliest_seeks_once_per_partition() {
        let assignment = assignment(OffsetResetStrategy::Earliest);
        let seeker = RecordingSeeker::default();

        assignment.on_assigned(&[0, 1], &seeker);
        assignment.on_revoked(&[0, 1]);
        assignment.on_assigned(&[0, 1, 2], &seeker);

        let seeks = seeker.seeks.lock().unwrap().clone();
        assert_eq!(
            seeks,
            vec![
                (0, SeekTo::Beginning),
                (1, SeekTo::Beginning),
                (2, SeekTo::Beginning)
            ]
        );
        assert_eq!(assignment.assigned(), vec![0, 1, 2]);
    }

    #[test]
    fn latest_seeks_to_end() {
        let assignment = assignment(OffsetResetStrategy::Latest);
        let seeker = RecordingSeeker::default();
        assignment.on_assigned(&[3], &seeker);
        assert_eq!(seeker.seeks.lock().unwrap()[0], (3, SeekTo::End));
    }

    #[test]
    fn current_never_seeks() {
        let assignment = assignment(OffsetResetStrategy::Current);
        let seeker = RecordingSeeker::default();
        assignment.on_assigned(&[0], &seeker);
        assert!(seeker.seeks.lock().unwrap().is_empty());
        assert!(assignment.is_seeded(0));
    }

    #[test]
    fn failed_seek_is_retried_on_next_assignment() {
        let assignment = assignment(OffsetResetStrategy::Earliest);
        let failing = RecordingSeeker {
            fail: true,
            ..Default::default()
        };
        assignment.on_assigned(&[0], &failing);
        assert!(!assignment.is_seeded(0));

        let seeker = RecordingSeeker::default();
        assignment.on_revoked(&[0]);
        assignment.on_assigned(&[0], &seeker);
        assert_eq!(seeker.seeks.lock().unwrap().len(), 1);
        assert!(assignment.is_seeded(0));
    }

    #[test]
    fn clear_keeps_seeding_history() {
        let assignment = assignment(OffsetResetStrategy::Earliest);
        let seeker = RecordingSeeker::default();
        assignment.on_assigned(&[0], &seeker);
        assignment.clear();

        assert!(assignment.partitions().is_empty());
        assignment.on_assigned(&[0], &seeker);
        assert_eq!(seeker.seeks.lock().unwrap().len(), 1);
    }

    #[test]
    fn lag_sums_assigned_partitions() {
        let assignment = assignment(OffsetResetStrategy::Current);
        assignment.on_assigned(&[0, 1], &RecordingSeeker::default());
        assignment.update_lag(HashMap::from([(0, 5), (1, 2), (7, 100)]));
        assert_eq!(assignment.lag(), 7);

        assignment.on_lost(&[1]);
        assert_eq!(assignment.lag(), 5);
        let ids: Vec<_> = assignment
            .partitions()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["local_orders_0"]);
    }
}
