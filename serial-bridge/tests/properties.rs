use proptest::prelude::*;
use serial_bridge::command::build_args;
use serial_bridge::config::is_wildcard_host;
use serial_bridge::{BridgeConfig, BridgeStatus, ProcessRecord, ProcessRegistry};
use std::path::Path;

fn any_status() -> impl Strategy<Value = BridgeStatus> {
    prop_oneof![
        Just(BridgeStatus::Starting),
        Just(BridgeStatus::Running),
        Just(BridgeStatus::Stopping),
        Just(BridgeStatus::Stopped),
        Just(BridgeStatus::Failed),
    ]
}

prop_compose! {
    fn any_config()(
        tcp_host in prop_oneof![Just("localhost".to_string()), Just("0.0.0.0".to_string()), "[a-z]{1,8}"],
        tcp_port in 1u16..=u16::MAX,
        verbose in any::<bool>(),
        hex_dump in any::<bool>(),
        block_size in proptest::option::of(1u32..65536),
        debug_level in 0u8..5,
        allow_fork in any::<bool>(),
        reuse_address in any::<bool>(),
        raw_mode in any::<bool>(),
        no_echo in any::<bool>()
    ) -> BridgeConfig {
        BridgeConfig {
            tcp_host,
            tcp_port,
            verbose,
            hex_dump,
            block_size,
            debug_level,
            allow_fork,
            reuse_address,
            raw_mode,
            no_echo,
            ..Default::default()
        }
    }
}

proptest! {
    #[test]
    fn addresses_come_last(config in any_config()) {
        let args = build_args(&config, Path::new("/dev/ttyUSB0"));
        let n = args.len();
        prop_assert!(n >= 2);

        let listen = &args[n - 2];
        let expected_prefix = format!("TCP-LISTEN:{}", config.tcp_port);
        prop_assert!(listen.starts_with(&expected_prefix));
        prop_assert_eq!(listen.contains(",bind="), !is_wildcard_host(&config.tcp_host));
        prop_assert_eq!(listen.contains(",fork"), config.allow_fork);
        prop_assert_eq!(listen.contains(",reuseaddr"), config.reuse_address);

        let serial = &args[n - 1];
        prop_assert!(serial.starts_with("/dev/ttyUSB0"));
        prop_assert_eq!(serial.contains(",raw"), config.raw_mode);
        prop_assert_eq!(serial.contains(",echo=0"), config.no_echo);
    }

    #[test]
    fn global_flags_match_config(config in any_config()) {
        let args = build_args(&config, Path::new("/dev/ttyS0"));
        let flags = &args[..args.len() - 2];

        prop_assert_eq!(flags.iter().filter(|a| *a == "-d").count(), config.debug_level as usize);
        prop_assert_eq!(flags.iter().any(|a| a == "-v"), config.verbose);
        prop_assert_eq!(flags.iter().any(|a| a == "-x"), config.hex_dump);
        match config.block_size {
            Some(size) => {
                let at = flags.iter().position(|a| a == "-b");
                prop_assert!(at.is_some());
                prop_assert_eq!(&flags[at.unwrap() + 1], &size.to_string());
            }
            None => prop_assert!(!flags.iter().any(|a| a == "-b")),
        }
    }

    #[test]
    fn status_only_moves_forward(updates in proptest::collection::vec(any_status(), 1..12)) {
        let registry = ProcessRegistry::new();
        let record = ProcessRecord::reserved(registry.next_id(), "localhost", 5000, "/dev/ttyUSB0", "socat");
        let id = record.id;
        registry.insert(record).unwrap();

        let mut current = BridgeStatus::Starting;
        for next in updates {
            let applied = registry.update_status(id, next, Some(1));
            prop_assert_eq!(applied, current.can_transition_to(next));
            if applied {
                current = next;
            }
            let stored = registry.get(id).unwrap();
            prop_assert_eq!(stored.status, current);
            prop_assert_eq!(stored.exit_code.is_some(), current.is_terminal());
        }
        prop_assert_eq!(registry.is_port_in_use("localhost", 5000), current.is_active());
    }
}
