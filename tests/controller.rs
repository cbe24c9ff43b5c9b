//! Integration coverage driven through the public `FrequencyController`
//! API.

use std::time::Duration;

use checkpoint_engine::{ControllerState, FrequencyController, ProfileReport, Strategy, StrategyCost};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn device_strategy_chosen_with_expected_cadence() {
    init_tracing();
    let mut controller = FrequencyController::new(5.0);
    controller.start();

    let report = ProfileReport {
        mean_iter_time: Duration::from_millis(50),
        peak_device_bytes: 0,
        free_device_bytes: 1000 * 1024 * 1024,
        checkpoint_bytes: 500 * 1024 * 1024,
        host: StrategyCost {
            snapshot_cost: Duration::from_millis(30),
            total_flush_cost: Duration::from_millis(120),
        },
        device: StrategyCost {
            snapshot_cost: Duration::from_millis(10),
            total_flush_cost: Duration::from_millis(120),
        },
    };

    let decision = controller.apply_profile(&report);
    assert_eq!(decision.strategy, Strategy::Device);
    assert_eq!(decision.chk_freq, 3);
    assert_eq!(controller.state(), ControllerState::Steady);
}

#[test]
fn overshoot_over_budget_backs_off_cadence() {
    init_tracing();
    let mut controller = FrequencyController::new(5.0);
    controller.start();

    let report = ProfileReport {
        mean_iter_time: Duration::from_millis(100),
        peak_device_bytes: 0,
        free_device_bytes: 0,
        checkpoint_bytes: 1,
        host: StrategyCost {
            snapshot_cost: Duration::from_millis(10),
            total_flush_cost: Duration::from_millis(50),
        },
        device: StrategyCost {
            snapshot_cost: Duration::from_millis(10),
            total_flush_cost: Duration::from_millis(50),
        },
    };
    controller.apply_profile(&report);
    let baseline_freq = controller.chk_freq();

    // 9% realized overhead against a 5% budget.
    let backed_off = controller.observe_window(Duration::from_millis(109));
    assert!(backed_off);
    assert_eq!(controller.chk_freq(), baseline_freq + 2);
    assert_eq!(controller.state(), ControllerState::Steady);

    // A subsequent window within budget leaves the cadence untouched.
    let stable = controller.observe_window(Duration::from_millis(102));
    assert!(!stable);
    assert_eq!(controller.chk_freq(), baseline_freq + 2);
}
