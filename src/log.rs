//! Logger capability handed to the simulation at initialize time.
//!
//! Messages are filtered by level and category masks and then forwarded to
//! `tracing`, so hosts pick the subscriber.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    const fn bit(self) -> u8 {
        match self {
            Self::Error => 1,
            Self::Warning => 1 << 1,
            Self::Info => 1 << 2,
            Self::Debug => 1 << 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogCategory {
    Lifecycle,
    Grid,
    Behaviour,
    Environment,
    Pattern,
    Noise,
}

impl LogCategory {
    const fn bit(self) -> u32 {
        match self {
            Self::Lifecycle => 1,
            Self::Grid => 1 << 1,
            Self::Behaviour => 1 << 2,
            Self::Environment => 1 << 3,
            Self::Pattern => 1 << 4,
            Self::Noise => 1 << 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Grid => "grid",
            Self::Behaviour => "behaviour",
            Self::Environment => "environment",
            Self::Pattern => "pattern",
            Self::Noise => "noise",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimLogger {
    levels: u8,
    categories: u32,
}

impl Default for SimLogger {
    /// Errors, warnings and info in every category.
    fn default() -> Self {
        Self {
            levels: LogLevel::Error.bit() | LogLevel::Warning.bit() | LogLevel::Info.bit(),
            categories: u32::MAX,
        }
    }
}

impl SimLogger {
    pub fn silent() -> Self {
        Self {
            levels: 0,
            categories: 0,
        }
    }

    pub fn verbose() -> Self {
        Self {
            levels: u8::MAX,
            categories: u32::MAX,
        }
    }

    pub fn with_level(mut self, level: LogLevel, enabled: bool) -> Self {
        if enabled {
            self.levels |= level.bit();
        } else {
            self.levels &= !level.bit();
        }
        self
    }

    pub fn with_category(mut self, category: LogCategory, enabled: bool) -> Self {
        if enabled {
            self.categories |= category.bit();
        } else {
            self.categories &= !category.bit();
        }
        self
    }

    pub fn enabled(&self, level: LogLevel, category: LogCategory) -> bool {
        self.levels & level.bit() != 0 && self.categories & category.bit() != 0
    }

    pub fn log(&self, level: LogLevel, category: LogCategory, message: fmt::Arguments<'_>) {
        if !self.enabled(level, category) {
            return;
        }
        let category = category.as_str();
        match level {
            LogLevel::Error => tracing::error!(category, "{}", message),
            LogLevel::Warning => tracing::warn!(category, "{}", message),
            LogLevel::Info => tracing::info!(category, "{}", message),
            LogLevel::Debug => tracing::debug!(category, "{}", message),
        }
    }

    pub fn error(&self, category: LogCategory, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, category, message);
    }

    pub fn warn(&self, category: LogCategory, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Warning, category, message);
    }

    pub fn info(&self, category: LogCategory, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, category, message);
    }

    pub fn debug(&self, category: LogCategory, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, category, message);
    }
}
