//! Tier/deopt controller (`spec.md` §4.6).
//!
//! Promotes a loop from `Baseline` to `Specialized` once its hit count
//! crosses [`SPECIALIZATION_THRESHOLD`], and re-evaluates that decision on
//! every subsequent visit against a hysteresis band scaled to the hit count
//! the loop was actually specialized at (`ref = max(specialization_hits,
//! SPECIALIZATION_THRESHOLD)`, stay specialized while `current >= ref / 4`).
//! A loop observed at zero hits with no specialization history is treated as
//! cold and demoted outright. An explicit guard failure (`bailout_and_deopt`)
//! demotes immediately regardless of the band, and blocklists the loop so
//! the dispatcher doesn't retry specialization on the very next visit.

use crate::jit::registry::{NativeBlock, Registry};
use crate::runtime::{DeoptTrigger, Vm};
use rustc_hash::FxHashMap;

pub const SPECIALIZATION_THRESHOLD: u64 = 512;
/// The reentry/retention band is a quarter of the reference hit count
/// (`spec.md` §4.6: "return specialized iff `current >= ref / 4`").
pub const HYSTERESIS_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Baseline,
    Specialized,
}

/// Source of per-loop execution counts. A trait rather than a concrete
/// counter so tests can supply deterministic counts without driving a real
/// interpreter loop thousands of times.
pub trait ProfileSource {
    fn hit_count(&self, function_index: u32, loop_index: u32) -> u64;
}

/// What the dispatcher should run for a given `(function_index,
/// loop_index)` this time through.
pub enum SelectedChunk<'a> {
    Interpret,
    Native(&'a NativeBlock),
}

struct LoopState {
    tier: Tier,
    /// The hit count this loop was last promoted at. `ref` in `spec.md`
    /// §4.6 is derived from this, not from the flat threshold, so a loop
    /// specialized well past the threshold keeps a correspondingly wider
    /// retention band.
    specialization_hits: u64,
}

impl LoopState {
    fn new() -> Self {
        LoopState {
            tier: Tier::Baseline,
            specialization_hits: 0,
        }
    }
}

/// The default deopt stub named by `spec.md` §4.6: demotes to `Baseline` and
/// clears the specialization history, so the next promotion starts counting
/// fresh from the flat threshold.
fn default_deopt_handler(state: &mut LoopState) {
    state.tier = Tier::Baseline;
    state.specialization_hits = 0;
}

pub struct TierController {
    loops: FxHashMap<(u32, u32), LoopState>,
    /// `spec.md` §4.6: "If profiling is off: return the specialized chunk
    /// (best-effort)." On by default — most dispatch loops have a live
    /// `ProfileSource`.
    profiling_enabled: bool,
}

impl Default for TierController {
    fn default() -> Self {
        TierController {
            loops: FxHashMap::default(),
            profiling_enabled: true,
        }
    }
}

impl TierController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_profiling_enabled(&mut self, enabled: bool) {
        self.profiling_enabled = enabled;
    }

    /// Decides the tier `(function_index, loop_index)` should run at, given
    /// `profile`'s hit count. With profiling disabled, a loop already
    /// specialized stays specialized best-effort: no hit count is consulted
    /// and the hysteresis band is never evaluated, so it can't demote.
    pub fn select_tier(
        &mut self,
        function_index: u32,
        loop_index: u32,
        profile: &dyn ProfileSource,
    ) -> Tier {
        let state = self
            .loops
            .entry((function_index, loop_index))
            .or_insert_with(LoopState::new);

        if !self.profiling_enabled {
            // Best-effort: keep whatever tier this loop is already at
            // (typically `Specialized`, since that's the resident chunk
            // worth reusing without profile data) rather than consulting
            // the hit count at all.
            return state.tier;
        }

        let current = profile.hit_count(function_index, loop_index);

        if state.tier != Tier::Specialized {
            if current >= SPECIALIZATION_THRESHOLD {
                state.tier = Tier::Specialized;
                state.specialization_hits = current;
            }
            return state.tier;
        }

        // Already specialized: a hit count of zero with no specialization
        // history at all means this loop never really ran hot — treat it as
        // cold rather than applying the ref/4 band.
        if current == 0 && state.specialization_hits == 0 {
            default_deopt_handler(state);
            return state.tier;
        }

        // `ref / 4`, computed as `current * 4 < ref` to stay in integer
        // arithmetic rather than round-tripping through floats.
        let reference = state.specialization_hits.max(SPECIALIZATION_THRESHOLD);
        if current.saturating_mul(4) < reference {
            default_deopt_handler(state);
        }
        state.tier
    }

    /// Picks what the dispatcher should run this time: the interpreter (a
    /// blocked or not-yet-specialized loop) or a resident native block.
    pub fn select_chunk<'a>(
        &mut self,
        vm: &Vm,
        registry: &'a Registry,
        function_index: u32,
        loop_index: u32,
        profile: &dyn ProfileSource,
    ) -> SelectedChunk<'a> {
        if vm.is_loop_blocked(loop_index) {
            return SelectedChunk::Interpret;
        }
        match self.select_tier(function_index, loop_index, profile) {
            Tier::Baseline => SelectedChunk::Interpret,
            Tier::Specialized => match registry.find_by_loop(function_index, loop_index) {
                Some(handle) => match registry.get(handle) {
                    Some(block) => SelectedChunk::Native(block),
                    None => SelectedChunk::Interpret,
                },
                None => SelectedChunk::Interpret,
            },
        }
    }

    /// Demotes `(function_index, loop_index)` to `Baseline` on a guard
    /// failure, blocklists it on `vm` so the dispatcher doesn't immediately
    /// retry specialization, queues the deopt trigger the VM consumes
    /// between bytecode instructions, and releases its native block (if
    /// resident).
    pub fn bailout_and_deopt(
        &mut self,
        vm: &mut Vm,
        registry: &mut Registry,
        function_index: u32,
        loop_index: u32,
    ) {
        let state = self
            .loops
            .entry((function_index, loop_index))
            .or_insert_with(LoopState::new);
        default_deopt_handler(state);

        vm.jit_native_type_deopts += 1;
        vm.loop_blocklist.insert(loop_index);
        vm.jit_pending_trigger = Some(DeoptTrigger {
            function_index,
            loop_index,
            generation: 0,
        });
        vm.jit_pending_invalidate = true;

        if let Some(handle) = registry.find_by_loop(function_index, loop_index) {
            registry.destroy_by_handle(handle);
        }
    }

    /// Drops tier state for one loop without touching the registry. Used
    /// when an external event (e.g. a chunk being replaced) means the next
    /// visit must recompile from scratch rather than reuse profile history.
    pub fn invalidate(&mut self, function_index: u32, loop_index: u32) {
        self.loops.remove(&(function_index, loop_index));
    }

    /// Drops all tier state and hands back every resident native block for
    /// the caller to release. Used on full chunk replacement or shutdown.
    pub fn flush(&mut self, registry: &mut Registry) -> Vec<NativeBlock> {
        self.loops.clear();
        registry.drain()
    }

    #[cfg(test)]
    fn tier_of(&self, function_index: u32, loop_index: u32) -> Option<Tier> {
        self.loops.get(&(function_index, loop_index)).map(|s| s.tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProfile(u64);
    impl ProfileSource for FixedProfile {
        fn hit_count(&self, _function_index: u32, _loop_index: u32) -> u64 {
            self.0
        }
    }

    #[test]
    fn below_threshold_stays_baseline() {
        let mut controller = TierController::new();
        let profile = FixedProfile(10);
        assert_eq!(controller.select_tier(0, 0, &profile), Tier::Baseline);
    }

    #[test]
    fn at_threshold_promotes_to_specialized() {
        let mut controller = TierController::new();
        let profile = FixedProfile(SPECIALIZATION_THRESHOLD);
        assert_eq!(controller.select_tier(0, 0, &profile), Tier::Specialized);
    }

    #[test]
    fn bailout_demotes_blocklists_and_queues_deopt_trigger() {
        let mut controller = TierController::new();
        let mut registry = Registry::new();
        let mut vm = Vm::new(1);
        let profile = FixedProfile(SPECIALIZATION_THRESHOLD);
        controller.select_tier(1, 2, &profile);
        assert_eq!(controller.tier_of(1, 2), Some(Tier::Specialized));

        controller.bailout_and_deopt(&mut vm, &mut registry, 1, 2);
        assert_eq!(controller.tier_of(1, 2), Some(Tier::Baseline));
        assert!(vm.is_loop_blocked(2));
        assert!(vm.jit_pending_invalidate);
        assert_eq!(
            vm.jit_pending_trigger,
            Some(DeoptTrigger { function_index: 1, loop_index: 2, generation: 0 })
        );
    }

    /// A loop specialized at a hit count well above the flat threshold keeps
    /// a correspondingly wider retention band: observed later at a quarter
    /// of its own specialization hit count (not a quarter of the flat
    /// threshold), it must still stay specialized.
    #[test]
    fn retention_band_scales_with_specialization_hit_count() {
        let mut controller = TierController::new();
        let high_hits = FixedProfile(2000);
        assert_eq!(controller.select_tier(0, 0, &high_hits), Tier::Specialized);

        // ref = max(2000, 512) = 2000; ref/4 = 500. 600 >= 500: stays specialized.
        let observed_above_band = FixedProfile(600);
        assert_eq!(controller.select_tier(0, 0, &observed_above_band), Tier::Specialized);

        // 300 < 500: falls below the band, demotes.
        let observed_below_band = FixedProfile(300);
        assert_eq!(controller.select_tier(0, 0, &observed_below_band), Tier::Baseline);
    }

    /// A loop specialized right at the flat threshold must stay specialized
    /// when later observed at a quarter of *that* count, even though a
    /// naive flat-threshold check would have demoted it.
    #[test]
    fn loop_specialized_at_threshold_stays_specialized_at_a_quarter_of_it() {
        let mut controller = TierController::new();
        let at_threshold = FixedProfile(SPECIALIZATION_THRESHOLD);
        assert_eq!(controller.select_tier(0, 0, &at_threshold), Tier::Specialized);

        // ref = max(512, 512) = 512; ref/4 = 128. 200 >= 128: stays specialized.
        let observed = FixedProfile(200);
        assert_eq!(controller.select_tier(0, 0, &observed), Tier::Specialized);
    }

    #[test]
    fn cold_loop_with_no_specialization_history_demotes() {
        let mut controller = TierController::new();
        let at_threshold = FixedProfile(SPECIALIZATION_THRESHOLD);
        controller.select_tier(0, 0, &at_threshold);
        controller.bailout_and_deopt(&mut Vm::new(1), &mut Registry::new(), 0, 0);

        // Back to Baseline with specialization_hits cleared; a cold (zero)
        // observation must not re-promote.
        let cold = FixedProfile(0);
        assert_eq!(controller.select_tier(0, 0, &cold), Tier::Baseline);
    }

    #[test]
    fn profiling_disabled_keeps_a_specialized_loop_specialized_regardless_of_hit_count() {
        let mut controller = TierController::new();
        let hot = FixedProfile(SPECIALIZATION_THRESHOLD);
        assert_eq!(controller.select_tier(0, 0, &hot), Tier::Specialized);

        controller.set_profiling_enabled(false);
        // Well below the retention band — with profiling on this would demote.
        let cold = FixedProfile(0);
        assert_eq!(controller.select_tier(0, 0, &cold), Tier::Specialized);
    }

    #[test]
    fn profiling_disabled_does_not_promote_a_never_specialized_loop() {
        let mut controller = TierController::new();
        controller.set_profiling_enabled(false);
        let hot = FixedProfile(SPECIALIZATION_THRESHOLD);
        assert_eq!(controller.select_tier(0, 0, &hot), Tier::Baseline);
    }

    #[test]
    fn select_chunk_interprets_blocked_loops() {
        let mut controller = TierController::new();
        let registry = Registry::new();
        let mut vm = Vm::new(1);
        vm.loop_blocklist.insert(5);
        let profile = FixedProfile(SPECIALIZATION_THRESHOLD);
        assert!(matches!(
            controller.select_chunk(&vm, &registry, 0, 5, &profile),
            SelectedChunk::Interpret
        ));
    }
}
