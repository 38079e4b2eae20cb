#![forbid(unsafe_code)]

//! Per-variable distance records and the environment threaded through
//! instrumentation.

use std::fmt;

use indexmap::IndexMap;
use tracing::trace;

use crate::distance::Distance;
use crate::names::Version;
use crate::sym::Sym;

/// One version of a variable's distance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tracked {
    Static(Distance),
    /// Held in the runtime variable `__SHADOWDP_<VERSION>_DISTANCE_<var>`.
    Dynamic,
}

impl Tracked {
    pub fn zero() -> Self {
        Tracked::Static(Distance::zero())
    }

    /// Normalize a static distance that is exactly the variable's own
    /// runtime distance back to `Dynamic`.
    pub fn normalized(version: Version, var: &str, d: Distance) -> Self {
        match d.as_runtime() {
            Some(r) if r.version == version && r.var == var && r.index.is_none() => Tracked::Dynamic,
            _ => Tracked::Static(d),
        }
    }

    pub fn resolve(&self, version: Version, var: &str) -> Distance {
        match self {
            Tracked::Static(d) => d.clone(),
            Tracked::Dynamic => Distance::runtime(version, var, None),
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Tracked::Static(d) if d.is_zero())
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Tracked::Dynamic)
    }

    pub fn as_static(&self) -> Option<&Distance> {
        match self {
            Tracked::Static(d) => Some(d),
            Tracked::Dynamic => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Aligned,
    Shadow,
}

/// Both distances of one variable.
///
/// `Aligned` means the two versions coincide; `Diverged` means adjacent runs
/// may have taken different paths and the shadow version evolves on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistanceRecord {
    Aligned(Distance),
    Diverged { aligned: Tracked, shadow: Tracked },
}

impl DistanceRecord {
    pub fn zero() -> Self {
        DistanceRecord::Aligned(Distance::zero())
    }

    pub fn new(aligned: Tracked, shadow: Tracked) -> Self {
        match (aligned, shadow) {
            (Tracked::Static(a), Tracked::Static(s)) if a == s => DistanceRecord::Aligned(a),
            (aligned, shadow) => DistanceRecord::Diverged { aligned, shadow },
        }
    }

    /// Record for a version pair computed for `var`, with self references
    /// normalized.
    pub fn for_var(var: &str, aligned: Distance, shadow: Tracked) -> Self {
        DistanceRecord::new(Tracked::normalized(Version::Aligned, var, aligned), shadow)
    }

    pub fn get(&self, version: Version) -> Tracked {
        match self {
            DistanceRecord::Aligned(d) => Tracked::Static(d.clone()),
            DistanceRecord::Diverged { aligned, shadow } => match version {
                Version::Aligned => aligned.clone(),
                Version::Shadow => shadow.clone(),
            },
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            DistanceRecord::Aligned(_) => Mode::Aligned,
            DistanceRecord::Diverged { .. } => Mode::Shadow,
        }
    }

    fn join(&self, other: &DistanceRecord) -> DistanceRecord {
        let pick = |v: Version| {
            let (a, b) = (self.get(v), other.get(v));
            if a == b { a } else { Tracked::Dynamic }
        };
        DistanceRecord::new(pick(Version::Aligned), pick(Version::Shadow))
    }

    fn specialize(&self, var: &str, cond: &Sym, truth: bool) -> Option<DistanceRecord> {
        let pick = |version: Version| match self.get(version) {
            Tracked::Static(d) => Some(Tracked::normalized(version, var, d.specialize(cond, truth)?)),
            Tracked::Dynamic => Some(Tracked::Dynamic),
        };
        Some(DistanceRecord::new(pick(Version::Aligned)?, pick(Version::Shadow)?))
    }

    fn with_version(&self, version: Version, tracked: Tracked) -> DistanceRecord {
        match version {
            Version::Aligned => DistanceRecord::new(tracked, self.get(Version::Shadow)),
            Version::Shadow => DistanceRecord::new(self.get(Version::Aligned), tracked),
        }
    }
}

/// One runtime distance assignment `__SHADOWDP_<VERSION>_DISTANCE_var = distance`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Materialize {
    pub version: Version,
    pub var: String,
    pub distance: Distance,
}

/// Chooses, at a noise draw, which distance the aligned execution adopts
/// from now on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Aligned,
    Shadow,
    Choose {
        cond: Sym,
        then: Box<Selector>,
        otherwise: Box<Selector>,
    },
}

impl Selector {
    pub fn mentions_shadow(&self) -> bool {
        match self {
            Selector::Aligned => false,
            Selector::Shadow => true,
            Selector::Choose { then, otherwise, .. } => then.mentions_shadow() || otherwise.mentions_shadow(),
        }
    }

    pub fn choose(&self, aligned: &Distance, shadow: &Distance) -> Distance {
        match self {
            Selector::Aligned => aligned.clone(),
            Selector::Shadow => shadow.clone(),
            Selector::Choose { cond, then, otherwise } => Distance::select(
                cond.clone(),
                then.choose(aligned, shadow),
                otherwise.choose(aligned, shadow),
            ),
        }
    }

    /// Same structure over plain expressions: `ALIGNED` yields `aligned`,
    /// `SHADOW` yields `shadow`.
    pub fn choose_sym(&self, aligned: &Sym, shadow: &Sym) -> Sym {
        match self {
            Selector::Aligned => aligned.clone(),
            Selector::Shadow => shadow.clone(),
            Selector::Choose { cond, then, otherwise } => Sym::ternary(
                cond.clone(),
                then.choose_sym(aligned, shadow),
                otherwise.choose_sym(aligned, shadow),
            ),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Aligned => f.write_str("ALIGNED"),
            Selector::Shadow => f.write_str("SHADOW"),
            Selector::Choose { cond, then, otherwise } => write!(f, "({cond}) ? {then} : {otherwise}"),
        }
    }
}

/// Variable name to distance record, in first-seen order.
///
/// Passed by value: a branch clones its parent and the join merges the two
/// children explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackingEnv {
    records: IndexMap<String, DistanceRecord>,
}

impl TrackingEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DistanceRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DistanceRecord)> {
        self.records.iter()
    }

    pub fn with(mut self, name: impl Into<String>, record: DistanceRecord) -> Self {
        self.records.insert(name.into(), record);
        self
    }

    pub fn without<'a>(mut self, names: impl IntoIterator<Item = &'a String>) -> Self {
        for name in names {
            self.records.shift_remove(name);
        }
        self
    }

    /// Distance of `name` in `version`, as an expression over runtime
    /// variables where the version is dynamic.
    pub fn distance(&self, name: &str, version: Version) -> Option<Distance> {
        self.records.get(name).map(|r| r.get(version).resolve(version, name))
    }

    /// Merge the environments of two control-flow paths. Versions that
    /// disagree become dynamic; the caller reconciles them at the join.
    ///
    /// A version that stays static must not read a runtime variable that
    /// one side is about to overwrite, so those are made dynamic as well.
    pub fn join(&self, other: &TrackingEnv) -> TrackingEnv {
        let mut merged = self.clone();
        for (name, theirs) in &other.records {
            let record = match merged.records.get(name) {
                Some(ours) if ours == theirs => continue,
                Some(ours) => ours.join(theirs),
                None => theirs.clone(),
            };
            trace!(variable = %name, ?record, "join");
            merged.records.insert(name.clone(), record);
        }
        loop {
            let mut writes = self.writes(&merged);
            writes.extend(other.writes(&merged));
            let mut changed = false;
            for (name, record) in merged.records.iter_mut() {
                for version in Version::BOTH {
                    let Tracked::Static(d) = record.get(version) else {
                        continue;
                    };
                    if writes.iter().any(|(v, var)| d.reads_runtime(*v, var)) {
                        trace!(variable = %name, version = version.label(), "join reads overwritten distance");
                        *record = record.with_version(version, Tracked::Dynamic);
                        changed = true;
                    }
                }
            }
            if !changed {
                return merged;
            }
        }
    }

    /// Runtime variables written when moving from `self` to `target`.
    fn writes(&self, target: &TrackingEnv) -> Vec<(Version, String)> {
        let mut out = Vec::new();
        for (name, wanted) in &target.records {
            let Some(have) = self.records.get(name) else {
                continue;
            };
            for version in Version::BOTH {
                if wanted.get(version).is_dynamic() && !have.get(version).is_dynamic() {
                    out.push((version, name.clone()));
                }
            }
        }
        out
    }

    /// Assignments that bring the runtime distance variables of `self` in
    /// line with `target`, ordered so that every right-hand side reads the
    /// values from before the first assignment. `Err` names the variables
    /// whose assignments depend on each other cyclically.
    pub fn reconcile(
        &self,
        target: &TrackingEnv,
        versions: &[Version],
    ) -> Result<Vec<Materialize>, Vec<String>> {
        let mut pending = Vec::new();
        for (name, wanted) in &target.records {
            let Some(have) = self.records.get(name) else {
                continue;
            };
            for &version in versions {
                if let (Tracked::Dynamic, Tracked::Static(d)) = (wanted.get(version), have.get(version)) {
                    pending.push(Materialize {
                        version,
                        var: name.clone(),
                        distance: d,
                    });
                }
            }
        }
        let mut ordered = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            // A write may go once no other pending right-hand side reads it.
            let ready = pending.iter().position(|m| {
                !pending.iter().any(|other| {
                    (other.version, &other.var) != (m.version, &m.var)
                        && other.distance.reads_runtime(m.version, &m.var)
                })
            });
            match ready {
                Some(i) => ordered.push(pending.remove(i)),
                None => return Err(pending.into_iter().map(|m| m.var).collect()),
            }
        }
        Ok(ordered)
    }

    /// Overwrite one version of a tracked variable.
    pub fn set(mut self, name: &str, version: Version, tracked: Tracked) -> Self {
        if let Some(record) = self.records.get_mut(name) {
            *record = record.with_version(version, tracked);
        }
        self
    }

    /// Resolve selections on `cond` inside a branch where `cond` is known.
    /// `None` if resolving overflows a coefficient.
    pub fn specialize(mut self, cond: &Sym, truth: bool) -> Option<Self> {
        for (name, record) in self.records.iter_mut() {
            *record = record.specialize(name, cond, truth)?;
        }
        Some(self)
    }

    /// Apply a noise-draw selector: every diverged variable not excluded by
    /// `skip` takes the selected distance as its new aligned distance.
    pub fn select(mut self, selector: &Selector, skip: impl Fn(&str) -> bool) -> Self {
        if *selector == Selector::Aligned {
            return self;
        }
        for (name, record) in self.records.iter_mut() {
            if skip(name) {
                continue;
            }
            let DistanceRecord::Diverged { aligned, shadow } = record else {
                continue;
            };
            let chosen = selector.choose(
                &aligned.resolve(Version::Aligned, name),
                &shadow.resolve(Version::Shadow, name),
            );
            *record = DistanceRecord::for_var(name, chosen, shadow.clone());
        }
        self
    }

    /// Names whose records differ between `self` and `other`.
    pub fn differences(&self, other: &TrackingEnv) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .filter(|(name, record)| other.records.get(*name) != Some(record))
            .map(|(name, _)| name.clone())
            .collect();
        for name in other.records.keys() {
            if !self.records.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratio::Ratio;

    fn c(n: i128) -> Distance {
        Distance::constant(Ratio::integer(n))
    }

    #[test]
    fn join_keeps_agreement_and_promotes_disagreement() {
        let left = TrackingEnv::new()
            .with("a", DistanceRecord::Aligned(c(1)))
            .with("b", DistanceRecord::Aligned(c(1)));
        let right = TrackingEnv::new()
            .with("a", DistanceRecord::Aligned(c(1)))
            .with("b", DistanceRecord::new(Tracked::Static(c(1)), Tracked::Static(c(2))));
        let joined = left.join(&right);
        assert_eq!(joined.get("a"), Some(&DistanceRecord::Aligned(c(1))));
        assert_eq!(
            joined.get("b"),
            Some(&DistanceRecord::Diverged {
                aligned: Tracked::Static(c(1)),
                shadow: Tracked::Dynamic
            })
        );
    }

    #[test]
    fn join_adds_missing_names() {
        let left = TrackingEnv::new().with("a", DistanceRecord::zero());
        let right = TrackingEnv::new().with("b", DistanceRecord::Aligned(c(2)));
        let joined = left.join(&right);
        assert!(joined.contains("a") && joined.contains("b"));
    }

    #[test]
    fn shadow_selector_adopts_shadow_distance() {
        let env = TrackingEnv::new().with(
            "bq",
            DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic),
        );
        let env = env.select(&Selector::Shadow, |_| false);
        assert_eq!(
            env.distance("bq", Version::Aligned),
            Some(Distance::runtime(Version::Shadow, "bq", None))
        );
        assert_eq!(env.get("bq").map(DistanceRecord::mode), Some(Mode::Shadow));
    }

    #[test]
    fn join_makes_readers_of_overwritten_distances_dynamic() {
        let reads_x = Distance::runtime(Version::Aligned, "x", None);
        let left = TrackingEnv::new()
            .with("x", DistanceRecord::Aligned(c(1)))
            .with("y", DistanceRecord::Aligned(reads_x.clone()));
        let right = TrackingEnv::new()
            .with("x", DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic))
            .with("y", DistanceRecord::Aligned(reads_x.clone()));
        let joined = left.join(&right);
        assert!(joined.get("y").unwrap().get(Version::Aligned).is_dynamic());

        let steps = left.reconcile(&joined, &[Version::Aligned]).unwrap();
        let order: Vec<&str> = steps.iter().map(|m| m.var.as_str()).collect();
        assert_eq!(order, ["y", "x"]);
    }

    #[test]
    fn reconcile_reports_cycles() {
        let ax = Distance::runtime(Version::Aligned, "x", None);
        let ay = Distance::runtime(Version::Aligned, "y", None);
        let from = TrackingEnv::new()
            .with("x", DistanceRecord::new(Tracked::Static(ay), Tracked::Dynamic))
            .with("y", DistanceRecord::new(Tracked::Static(ax), Tracked::Dynamic));
        let to = TrackingEnv::new()
            .with("x", DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic))
            .with("y", DistanceRecord::new(Tracked::Dynamic, Tracked::Dynamic));
        assert!(from.reconcile(&to, &Version::BOTH).is_err());
    }

    #[test]
    fn specialize_normalizes_self_references() {
        let cond = Sym::var("c");
        let own = Distance::runtime(Version::Aligned, "bq", None);
        let other = Distance::runtime(Version::Shadow, "bq", None);
        let env = TrackingEnv::new().with(
            "bq",
            DistanceRecord::new(Tracked::Static(Distance::select(cond.clone(), other, own)), Tracked::Dynamic),
        );
        let on_false = env.specialize(&cond, false).unwrap();
        assert_eq!(
            on_false.get("bq"),
            Some(&DistanceRecord::Diverged {
                aligned: Tracked::Dynamic,
                shadow: Tracked::Dynamic
            })
        );
    }

    #[test]
    fn aligned_records_report_aligned_mode() {
        assert_eq!(DistanceRecord::zero().mode(), Mode::Aligned);
        assert_eq!(
            DistanceRecord::new(Tracked::Static(c(3)), Tracked::Static(c(3))),
            DistanceRecord::Aligned(c(3))
        );
    }
}
