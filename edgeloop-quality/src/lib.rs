// Edgeloop Quality - Validation and aggregation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Edgeloop Quality
//!
//! The two stream stages between collectors and exporters:
//!
//! - **Validation**: raw readings are classified GOOD / SUSPECT / UNCERTAIN /
//!   BAD, BAD ones are routed to the dead-letter stream, gaps are reported
//! - **Aggregation**: clean readings are rolled up into tumbling windows at
//!   several resolutions at once
//!
//! Both are synchronous state machines. Time comes from the readings
//! themselves or is passed in, so the same input always gives the same output.
//!
//! ## Usage
//!
//! ```rust
//! use edgeloop::{ParameterRule, QualityCode, Reading, ValidationRules};
//! use edgeloop_quality::{Aggregator, AggregatorConfig, QualityValidator, ValidatorConfig, Verdict};
//!
//! let mut rules = ValidationRules::default();
//! rules.parameters.insert("pressure".into(), ParameterRule::range(0.0, 500.0));
//!
//! let mut validator = QualityValidator::new(rules, ValidatorConfig::default());
//! let mut aggregator = Aggregator::new(AggregatorConfig::default());
//!
//! let raw = Reading::new("press-1", "pressure", 612.0, 1_000).with_device_time_ms(1_000);
//! assert!(matches!(validator.validate(&raw).verdict, Verdict::DeadLetter(_)));
//!
//! let raw = Reading::new("press-1", "pressure", 212.0, 2_000).with_device_time_ms(2_000);
//! if let Verdict::Forward(clean) = validator.validate(&raw).verdict {
//!     assert_eq!(clean.quality, Some(QualityCode::Good));
//!     aggregator.ingest(&clean, Some(0));
//! }
//! assert_eq!(aggregator.open_windows(), 3);
//! ```

pub mod aggregator;
pub mod stats;
pub mod validator;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorStats};
pub use stats::WindowAccumulator;
pub use validator::{
    apply_decision, Output, QualityValidator, Validation, ValidatorConfig, ValidatorStats, Verdict,
};
