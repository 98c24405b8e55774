/// Heuristic verdict on a finished command's output: did the launched
/// application come up and keep running? Scores indicator groups found in
/// the text.

use regex::RegexSet;
use std::sync::LazyLock;

const WINDOW_INDICATORS: &[&str] = &[
    "createSurface", "Surface created", "ViewRootImpl", "DecorView", "WindowManager",
    "addView", "window visible", "I/ActivityTaskManager", "display added", "Displayed",
    "added window", "shown window", "Creating view", "HwBinder", "startActivity",
    "ActivityRecord", "SurfaceView", "I/art", "Starting display", "starting window",
    "relayoutWindow",
];

const CRASH_INDICATORS: &[&str] = &[
    "FATAL EXCEPTION", "Fatal signal", "Force finishing activity", "ANR ",
    "Application Not Responding", "Crash", "java.lang.NullPointerException", "SIGSEGV",
    "SIGABRT", "kernel panic", "The application may be doing too much work on its main thread",
];

const RESPONSIVE_INDICATORS: &[&str] = &[
    "onDraw", "dispatchTouchEvent", "ViewGroup.dispatchDraw",
    "ViewGroup.updateDisplayListIfDirty", "choreographer", "onMeasure", "onLayout",
    "I/chatty", "I/InputReader", "I/InputDispatcher", "drawFrame", "animating",
    "handle motion", "MotionEvent", "reportFocus", "focus changed", "setFocusedWindow",
    "I/BufferQueue", "Vsync", "renderThread", "draw()",
];

const INIT_INDICATORS: &[&str] = &[
    "onCreate", "onStart", "onResume", "Activity started", "ApplicationInfo",
    "PackageManager.getApplicationInfo", "LoadedApk.makeApplication", "Added application",
    "ActivityThread.handleBindApplication", "Initializing", "ActivityManager", "activityIdle",
    "Starting: Intent", "initializeProcessState", "preload", "initializing",
    "Running ClassVerifier", "initialized", "ClassLoader", "Starting activity",
];

const ACTIVITY_INDICATORS: &[&str] = &["Activity:", "Starting activity"];

const SUCCESS_INDICATORS: &[&str] = &[
    "I/zygote", "I/ActivityManager", "I/art", "I/System", "I/OpenGLRenderer",
    "I/SurfaceFlinger", "I/ActivityTaskManager", "D/libEGL", "D/gralloc", "D/SurfaceControl",
    "onConfigurationChanged", "updateConfiguration", "I/Choreographer", "I/audio", "I/media",
    "I/MediaPlayer", "I/TextInputI", "I/ViewRootImpl", "I/StatusBar", "prepared", "I/Timeline",
];

/// Score at or above which the output counts as a working application.
pub const WORKING_THRESHOLD: u8 = 40;

const BASE_SCORE: i32 = 20;

/// A set of literal indicators, matched all at once.
struct Indicators {
    patterns: &'static [&'static str],
    set: RegexSet,
}

impl Indicators {
    fn new(patterns: &'static [&'static str]) -> Self {
        let set = RegexSet::new(patterns.iter().map(|p| regex::escape(p)))
            .unwrap_or_else(|_| RegexSet::empty());
        Self { patterns, set }
    }

    /// Number of distinct indicators present.
    fn hits(&self, text: &str) -> usize {
        self.set.matches(text).iter().count()
    }

    fn first(&self, text: &str) -> Option<&'static str> {
        self.set.matches(text).iter().next().map(|i| self.patterns[i])
    }
}

static WINDOW: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(WINDOW_INDICATORS));
static CRASH: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(CRASH_INDICATORS));
static RESPONSIVE: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(RESPONSIVE_INDICATORS));
static INIT: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(INIT_INDICATORS));
static ACTIVITY: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(ACTIVITY_INDICATORS));
static SUCCESS: LazyLock<Indicators> = LazyLock::new(|| Indicators::new(SUCCESS_INDICATORS));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub working: bool,
    /// 0..=100
    pub score: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> Verdict {
        let mut score = BASE_SCORE;
        let mut reasons = Vec::new();

        if WINDOW.hits(text) >= 2 {
            score += 25;
            reasons.push("window creation signals detected".to_string());
        } else {
            score -= 10;
            reasons.push("limited window creation signals".to_string());
        }

        match CRASH.first(text) {
            Some(pattern) => {
                score -= 60;
                reasons.push(format!("application crashed: {pattern}"));
            }
            None => {
                score += 25;
                reasons.push("no crashes detected".to_string());
            }
        }

        if RESPONSIVE.hits(text) >= 1 {
            score += 20;
            reasons.push("UI appears responsive".to_string());
        }

        if INIT.hits(text) >= 2 {
            score += 20;
            reasons.push("application initialized".to_string());
        } else {
            score -= 10;
            reasons.push("incomplete initialization signals".to_string());
        }

        if ACTIVITY.hits(text) >= 1 {
            score += 15;
            reasons.push("activity startup detected".to_string());
        }

        if SUCCESS.hits(text) >= 3 {
            score += 20;
            reasons.push("common success signals detected".to_string());
        }

        let score = score.clamp(0, 100) as u8;
        Verdict {
            working: score >= WORKING_THRESHOLD,
            score,
            reason: reasons.join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_output_is_not_working() {
        // 20 - 10 + 25 - 10
        let v = Classifier::new().classify("");
        assert_eq!(v.score, 25);
        assert!(!v.working);
    }

    #[test]
    fn test_healthy_launch() {
        let log = "\
I/ActivityTaskManager: START u0
D/ViewRootImpl: relayoutWindow
onCreate called
onResume called
Starting activity com.example/.Main
choreographer frame
";
        let v = Classifier::new().classify(log);
        assert!(v.working);
        assert_eq!(v.score, 100);
        assert!(v.reason.contains("no crashes detected"));
    }

    #[test]
    fn test_crash_dominates() {
        let log = "onCreate\nonStart\nDecorView\nSurfaceView\nFATAL EXCEPTION: main\n";
        let v = Classifier::new().classify(log);
        assert!(!v.working);
        assert!(v.reason.contains("FATAL EXCEPTION"));
    }

    #[test]
    fn test_single_window_indicator_is_not_enough() {
        let one = Classifier::new().classify("DecorView");
        let two = Classifier::new().classify("DecorView addView");
        assert_eq!(two.score - one.score, 35);
    }

    #[test]
    fn test_indicators_are_literal() {
        // "draw()" must not behave as a regex group.
        assert_eq!(RESPONSIVE.hits("draw"), 0);
        assert_eq!(RESPONSIVE.hits("calling draw()"), 1);
    }
}
