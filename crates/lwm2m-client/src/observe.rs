//! Observation manager
//!
//! Keeps notification attributes written with Write-Attributes and the
//! active Observe subscriptions. The manager decides *when* a
//! subscription needs attention and *whether* a freshly read value is
//! worth a notification; reading and sending is left to the engine.
//!
//! Attributes are inherited object -> instance -> resource, on top of the
//! server's default minimum and maximum period.

use std::collections::BTreeMap;
use std::time::Duration;

use lwm2m_core::{ObjectError, Path, ReadOutput, ResourceValue};
use tokio::time::Instant;
use tracing::debug;

/// Observe sequence numbers are 24 bits wide
const SEQUENCE_MASK: u32 = 0x00FF_FFFF;

/// Notification attributes (`pmin`, `pmax`, `gt`, `lt`, `st`)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attributes {
    pub pmin: Option<u32>,
    pub pmax: Option<u32>,
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub st: Option<f64>,
}

impl Attributes {
    /// Apply Write-Attributes query parameters
    ///
    /// `name=value` sets an attribute, a bare `name` removes it. The whole
    /// query is rejected if any parameter is unknown or malformed.
    pub fn apply_query<S: AsRef<str>>(&mut self, query: &[S]) -> Result<(), ObjectError> {
        let mut next = *self;
        for item in query {
            let item = item.as_ref();
            let (name, value) = match item.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (item, None),
            };
            match name {
                "pmin" => next.pmin = value.map(parse_period).transpose()?,
                "pmax" => next.pmax = value.map(parse_period).transpose()?,
                "gt" => next.gt = value.map(parse_number).transpose()?,
                "lt" => next.lt = value.map(parse_number).transpose()?,
                "st" => next.st = value.map(parse_number).transpose()?,
                // Cancel is carried in the query by some servers, not an attribute
                "cancel" => {}
                other => {
                    return Err(ObjectError::BadRequest(format!(
                        "unknown attribute {:?}",
                        other
                    )))
                }
            }
        }
        next.check()?;
        *self = next;
        Ok(())
    }

    fn check(&self) -> Result<(), ObjectError> {
        if let (Some(pmin), Some(pmax)) = (self.pmin, self.pmax) {
            if pmax < pmin {
                return Err(ObjectError::BadRequest(format!(
                    "pmax {} is below pmin {}",
                    pmax, pmin
                )));
            }
        }
        if let Some(st) = self.st {
            if st < 0.0 {
                return Err(ObjectError::BadRequest("st must not be negative".into()));
            }
        }
        if let (Some(gt), Some(lt)) = (self.gt, self.lt) {
            if lt + 2.0 * self.st.unwrap_or(0.0) >= gt {
                return Err(ObjectError::BadRequest(format!(
                    "lt {} must stay below gt {}",
                    lt, gt
                )));
            }
        }
        Ok(())
    }

    /// Fields set here win over `parent`
    pub fn over(&self, parent: &Attributes) -> Attributes {
        Attributes {
            pmin: self.pmin.or(parent.pmin),
            pmax: self.pmax.or(parent.pmax),
            gt: self.gt.or(parent.gt),
            lt: self.lt.or(parent.lt),
            st: self.st.or(parent.st),
        }
    }

    pub fn has_threshold(&self) -> bool {
        self.gt.is_some() || self.lt.is_some() || self.st.is_some()
    }

    /// Render as link-format attributes for Discover, e.g. `;pmin=10`
    pub fn to_link_params(&self) -> String {
        let mut out = String::new();
        if let Some(v) = self.pmin {
            out.push_str(&format!(";pmin={}", v));
        }
        if let Some(v) = self.pmax {
            out.push_str(&format!(";pmax={}", v));
        }
        if let Some(v) = self.gt {
            out.push_str(&format!(";gt={}", v));
        }
        if let Some(v) = self.lt {
            out.push_str(&format!(";lt={}", v));
        }
        if let Some(v) = self.st {
            out.push_str(&format!(";st={}", v));
        }
        out
    }
}

fn parse_period(value: &str) -> Result<u32, ObjectError> {
    value
        .parse()
        .map_err(|_| ObjectError::BadRequest(format!("invalid period {:?}", value)))
}

fn parse_number(value: &str) -> Result<f64, ObjectError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ObjectError::BadRequest(format!("invalid threshold {:?}", value)))
}

/// Numeric value of a single-resource read, used for threshold triggers
pub fn numeric_value(output: &ReadOutput) -> Option<f64> {
    match output {
        ReadOutput::Resource(_, ResourceValue::Single(value)) => value.as_f64(),
        ReadOutput::ResourceInstance(_, _, value) => value.as_f64(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub token: Vec<u8>,
    pub path: Path,
    pub content_format: u16,
    /// Attributes in force, recomputed when attributes are written
    pub attributes: Attributes,
    /// Server default periods the attributes were resolved against
    defaults: Attributes,
    sequence: u32,
    last_sent: Instant,
    last_payload: Vec<u8>,
    last_value: Option<f64>,
    /// A change is pending but pmin held it back
    dirty: bool,
    next_sample: Instant,
}

impl Observation {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    fn pmin(&self) -> Duration {
        Duration::from_secs(u64::from(self.attributes.pmin.unwrap_or(0)))
    }

    fn pmax(&self) -> Option<Duration> {
        self.attributes
            .pmax
            .filter(|p| *p > 0)
            .map(|p| Duration::from_secs(u64::from(p)))
    }

    fn deadline(&self) -> Instant {
        let mut deadline = self.next_sample;
        if let Some(pmax) = self.pmax() {
            deadline = deadline.min(self.last_sent + pmax);
        }
        if self.dirty {
            deadline = deadline.min(self.last_sent + self.pmin());
        }
        deadline
    }
}

pub struct ObservationManager {
    attributes: BTreeMap<Path, Attributes>,
    observations: BTreeMap<Vec<u8>, Observation>,
    sample_interval: Duration,
}

impl ObservationManager {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            attributes: BTreeMap::new(),
            observations: BTreeMap::new(),
            sample_interval: sample_interval.max(Duration::from_millis(100)),
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn write_attributes<S: AsRef<str>>(&mut self, path: Path, query: &[S]) -> Result<(), ObjectError> {
        let mut attrs = self.attributes.get(&path).copied().unwrap_or_default();
        attrs.apply_query(query)?;
        debug!(path = %path, ?attrs, "Attributes written");
        if attrs == Attributes::default() {
            self.attributes.remove(&path);
        } else {
            self.attributes.insert(path, attrs);
        }
        // Running subscriptions pick up the new attributes
        let updates: Vec<(Vec<u8>, Attributes)> = self
            .observations
            .values()
            .filter(|o| path.contains(&o.path))
            .map(|o| (o.token.clone(), self.effective(&o.path, &o.defaults)))
            .collect();
        for (token, attributes) in updates {
            if let Some(o) = self.observations.get_mut(&token) {
                o.attributes = attributes;
            }
        }
        Ok(())
    }

    /// Attributes written exactly at `path`
    pub fn attributes_at(&self, path: &Path) -> Option<&Attributes> {
        self.attributes.get(path)
    }

    /// Attributes in force for `path`, inheriting object -> instance ->
    /// resource on top of `defaults`
    pub fn effective(&self, path: &Path, defaults: &Attributes) -> Attributes {
        let mut chain = vec![Path::object(path.object)];
        if let Some(instance) = path.instance {
            chain.push(Path::instance(path.object, instance));
            if let Some(resource) = path.resource {
                chain.push(Path::resource(path.object, instance, resource));
                if path.resource_instance.is_some() {
                    chain.push(*path);
                }
            }
        }
        chain.iter().fold(*defaults, |acc, p| match self.attributes.get(p) {
            Some(attrs) => attrs.over(&acc),
            None => acc,
        })
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register an observation whose initial response carries `payload`
    ///
    /// `defaults` are the server's default periods. Returns the Observe
    /// sequence number for the initial response. Observing again with the
    /// same token replaces the subscription.
    pub fn observe(
        &mut self,
        token: Vec<u8>,
        path: Path,
        content_format: u16,
        defaults: Attributes,
        payload: Vec<u8>,
        value: Option<f64>,
        now: Instant,
    ) -> u32 {
        let sequence = self
            .observations
            .get(&token)
            .map(|o| (o.sequence + 1) & SEQUENCE_MASK)
            .unwrap_or(0);
        let attributes = self.effective(&path, &defaults);
        debug!(path = %path, token = ?token, ?attributes, "Observation added");
        self.observations.insert(
            token.clone(),
            Observation {
                token,
                path,
                content_format,
                attributes,
                defaults,
                sequence,
                last_sent: now,
                last_payload: payload,
                last_value: value,
                dirty: false,
                next_sample: now + self.sample_interval,
            },
        );
        sequence
    }

    pub fn get(&self, token: &[u8]) -> Option<&Observation> {
        self.observations.get(token)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn cancel_token(&mut self, token: &[u8]) -> bool {
        let removed = self.observations.remove(token).is_some();
        if removed {
            debug!(token = ?token, "Observation cancelled");
        }
        removed
    }

    /// Cancel a GET Observe=1 for `path`, returning the removed tokens
    pub fn cancel_path(&mut self, path: &Path) -> Vec<Vec<u8>> {
        let tokens: Vec<Vec<u8>> = self
            .observations
            .values()
            .filter(|o| o.path == *path)
            .map(|o| o.token.clone())
            .collect();
        for token in &tokens {
            self.observations.remove(token);
        }
        tokens
    }

    /// Drop subscriptions and attributes at or below a deleted path
    pub fn remove_under(&mut self, path: &Path) {
        self.observations.retain(|_, o| !path.contains(&o.path));
        self.attributes.retain(|p, _| !path.contains(p));
    }

    /// Drop every subscription, keeping written attributes
    pub fn clear(&mut self) {
        if !self.observations.is_empty() {
            debug!(count = self.observations.len(), "Observations cleared");
        }
        self.observations.clear();
    }

    /// Note that a value at `changed` was modified locally
    pub fn mark_changed(&mut self, changed: &Path) {
        for o in self.observations.values_mut() {
            if o.path.contains(changed) || changed.contains(&o.path) {
                o.dirty = true;
            }
        }
    }

    /// Tokens whose subscription should be re-read now
    pub fn due(&self, now: Instant) -> Vec<Vec<u8>> {
        self.observations
            .values()
            .filter(|o| o.deadline() <= now)
            .map(|o| o.token.clone())
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.observations.values().map(Observation::deadline).min()
    }

    /// Decide on a fresh reading for `token`
    ///
    /// Returns the sequence number to notify with, or `None` when nothing
    /// should be sent yet.
    pub fn evaluate(&mut self, token: &[u8], payload: &[u8], value: Option<f64>, now: Instant) -> Option<u32> {
        let sample_interval = self.sample_interval;
        let o = self.observations.get_mut(token)?;
        o.next_sample = now + sample_interval;

        let elapsed = now.saturating_duration_since(o.last_sent);
        let pmax_expired = o.pmax().is_some_and(|pmax| elapsed >= pmax);
        let triggered = match (o.attributes.has_threshold(), value, o.last_value) {
            (true, Some(new), Some(old)) => crosses(&o.attributes, old, new),
            (true, Some(_), None) => true,
            _ => payload != o.last_payload.as_slice(),
        };

        if !pmax_expired && !triggered {
            o.dirty = false;
            return None;
        }
        if !pmax_expired && elapsed < o.pmin() {
            o.dirty = true;
            return None;
        }

        o.sequence = (o.sequence + 1) & SEQUENCE_MASK;
        o.last_sent = now;
        o.last_payload = payload.to_vec();
        o.last_value = value;
        o.dirty = false;
        Some(o.sequence)
    }
}

/// Whether moving from `old` to `new` crosses gt/lt or moves at least st
fn crosses(attrs: &Attributes, old: f64, new: f64) -> bool {
    let over = |limit: f64| (old <= limit) != (new <= limit);
    attrs.gt.is_some_and(over)
        || attrs.lt.is_some_and(|limit| (old < limit) != (new < limit))
        || attrs.st.is_some_and(|step| (new - old).abs() >= step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token(n: u8) -> Vec<u8> {
        vec![n]
    }

    #[test]
    fn test_apply_query() {
        let mut attrs = Attributes::default();
        attrs.apply_query(&["pmin=10", "pmax=60", "gt=20.5"]).unwrap();
        assert_eq!(attrs.pmin, Some(10));
        assert_eq!(attrs.gt, Some(20.5));
        attrs.apply_query(&["gt"]).unwrap();
        assert_eq!(attrs.gt, None);

        let rejects = |query: &[&str]| {
            let mut copy = attrs;
            copy.apply_query(query).is_err()
        };
        assert!(rejects(&["pmax=5"]));
        assert!(rejects(&["foo=1"]));
        assert!(rejects(&["gt=10", "lt=20"]));
        // Rejected queries leave the attributes untouched
        assert_eq!(attrs.pmax, Some(60));
    }

    #[test]
    fn test_inheritance() {
        let mut manager = ObservationManager::new(Duration::from_secs(5));
        manager.write_attributes(Path::object(3), &["pmax=300"]).unwrap();
        manager.write_attributes(Path::instance(3, 0), &["pmin=5"]).unwrap();
        manager
            .write_attributes(Path::resource(3, 0, 9), &["pmax=60"])
            .unwrap();

        let defaults = Attributes {
            pmin: Some(1),
            ..Default::default()
        };
        let attrs = manager.effective(&Path::resource(3, 0, 9), &defaults);
        assert_eq!(attrs.pmin, Some(5));
        assert_eq!(attrs.pmax, Some(60));
        let attrs = manager.effective(&Path::resource(3, 0, 10), &defaults);
        assert_eq!(attrs.pmax, Some(300));
        assert_eq!(manager.effective(&Path::object(4), &defaults), defaults);
    }

    #[test]
    fn test_pmax_without_change_notifies_once_per_period() {
        let mut manager = ObservationManager::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let attrs = Attributes {
            pmax: Some(60),
            ..Default::default()
        };
        manager.observe(token(1), Path::resource(3, 0, 9), 0, attrs, b"80".to_vec(), Some(80.0), t0);

        let mut sent = Vec::new();
        let mut now = t0;
        while now < t0 + Duration::from_secs(180) {
            now += Duration::from_secs(1);
            for t in manager.due(now) {
                if let Some(seq) = manager.evaluate(&t, b"80", Some(80.0), now) {
                    sent.push((now - t0).as_secs());
                    assert_eq!(seq as usize, sent.len());
                }
            }
        }
        assert_eq!(sent, vec![60, 120, 180]);
    }

    #[test]
    fn test_threshold_crossing_notifies_immediately() {
        let mut manager = ObservationManager::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let attrs = Attributes {
            pmax: Some(60),
            gt: Some(50.0),
            ..Default::default()
        };
        manager.observe(token(1), Path::resource(4, 0, 2), 0, attrs, b"40".to_vec(), Some(40.0), t0);

        let t1 = t0 + Duration::from_secs(2);
        // Change that stays below the threshold
        assert_eq!(manager.evaluate(&token(1), b"45", Some(45.0), t1), None);
        manager.mark_changed(&Path::resource(4, 0, 2));
        assert_eq!(manager.due(t1), vec![token(1)]);
        assert_eq!(manager.evaluate(&token(1), b"55", Some(55.0), t1), Some(1));
    }

    #[test]
    fn test_pmin_defers_change() {
        let mut manager = ObservationManager::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let attrs = Attributes {
            pmin: Some(10),
            ..Default::default()
        };
        manager.observe(token(7), Path::resource(3, 0, 13), 0, attrs, b"a".to_vec(), None, t0);

        let t1 = t0 + Duration::from_secs(3);
        assert_eq!(manager.evaluate(&token(7), b"b", None, t1), None);
        assert_eq!(manager.next_deadline(), Some(t0 + Duration::from_secs(10)));
        let t2 = t0 + Duration::from_secs(10);
        assert_eq!(manager.due(t2), vec![token(7)]);
        assert_eq!(manager.evaluate(&token(7), b"b", None, t2), Some(1));
    }

    #[test]
    fn test_cancel_and_remove() {
        let mut manager = ObservationManager::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let attrs = Attributes::default();
        manager.observe(token(1), Path::resource(12, 0, 1), 0, attrs, Vec::new(), None, t0);
        manager.observe(token(2), Path::instance(12, 1), 11542, attrs, Vec::new(), None, t0);
        manager.observe(token(3), Path::resource(3, 0, 9), 0, attrs, Vec::new(), None, t0);

        assert_eq!(manager.cancel_path(&Path::resource(3, 0, 9)), vec![token(3)]);
        manager.remove_under(&Path::instance(12, 1));
        assert!(manager.get(&token(2)).is_none());
        assert!(manager.cancel_token(&token(1)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_sequence_wraps_at_24_bits() {
        let mut manager = ObservationManager::new(Duration::from_secs(5));
        let t0 = Instant::now();
        manager.observe(token(1), Path::resource(3, 0, 13), 0, Attributes::default(), Vec::new(), None, t0);
        if let Some(o) = manager.observations.get_mut(&token(1)) {
            o.sequence = SEQUENCE_MASK;
        }
        assert_eq!(manager.evaluate(&token(1), b"x", None, t0), Some(0));
    }
}
