mod monitor_tests;
mod notifier_tests;
mod tunnel_tests;
mod watchdog_tests;
