//! Two-tier FIFO of page jobs, at most one per page.

use std::collections::VecDeque;

use super::job::{Job, Priority};
use crate::model::PageNumber;

#[derive(Debug, Default)]
pub struct JobQueue {
    front: VecDeque<Job>,
    back: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.front.len() + self.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty() && self.back.is_empty()
    }

    /// Tier currently holding a job for `page`.
    pub fn position(&self, page: PageNumber) -> Option<Priority> {
        if self.front.iter().any(|job| job.page == page) {
            Some(Priority::Front)
        } else if self.back.iter().any(|job| job.page == page) {
            Some(Priority::Back)
        } else {
            None
        }
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.position(page).is_some()
    }

    /// Append a job. Any job already queued for the page is replaced.
    pub fn push(&mut self, job: Job, priority: Priority) {
        self.remove(job.page);
        match priority {
            Priority::Front => self.front.push_back(job),
            Priority::Back => self.back.push_back(job),
        }
    }

    /// Move a back job to the end of the front tier.
    pub fn promote(&mut self, page: PageNumber) -> bool {
        let Some(index) = self.back.iter().position(|job| job.page == page) else {
            return false;
        };
        match self.back.remove(index) {
            Some(job) => {
                self.front.push_back(job);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, page: PageNumber) -> Option<Job> {
        for tier in [&mut self.front, &mut self.back] {
            if let Some(index) = tier.iter().position(|job| job.page == page) {
                return tier.remove(index);
            }
        }
        None
    }

    /// Next job to run: front tier first, FIFO within a tier.
    pub fn pop(&mut self) -> Option<Job> {
        self.front.pop_front().or_else(|| self.back.pop_front())
    }

    pub fn pages(&self) -> impl Iterator<Item = PageNumber> + '_ {
        self.front.iter().chain(self.back.iter()).map(|job| job.page)
    }

    pub fn drain(&mut self) -> Vec<Job> {
        self.front.drain(..).chain(self.back.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_front_served_before_back_fifo_within_tier() {
        let mut queue = JobQueue::new();
        queue.push(Job::translate(5), Priority::Back);
        queue.push(Job::translate(1), Priority::Front);
        queue.push(Job::translate(6), Priority::Back);
        queue.push(Job::translate(2), Priority::Front);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|j| j.page).collect();
        assert_eq!(order, vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_promote_keeps_single_job() {
        let mut queue = JobQueue::new();
        queue.push(Job::translate(3), Priority::Back);
        queue.push(Job::translate(4), Priority::Back);

        assert!(queue.promote(4));
        assert!(!queue.promote(4));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.position(4), Some(Priority::Front));
        assert_eq!(queue.pop().map(|j| j.page), Some(4));
    }

    #[test]
    fn test_push_replaces_existing_job_for_page() {
        let mut queue = JobQueue::new();
        queue.push(Job::translate(7), Priority::Front);
        queue.push(Job::translate(7), Priority::Back);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.position(7), Some(Priority::Back));
    }

    #[test]
    fn test_remove_and_drain() {
        let mut queue = JobQueue::new();
        queue.push(Job::translate(1), Priority::Front);
        queue.push(Job::translate(2), Priority::Back);
        assert_eq!(queue.remove(1).map(|j| j.page), Some(1));
        assert!(queue.remove(1).is_none());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
