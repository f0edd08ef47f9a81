#![no_main]

use listbuffer_core::config::BufferConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let parsed = [BufferConfig::from_yaml_str(text), BufferConfig::from_toml_str(text)];
    for config in parsed.into_iter().flatten() {
        if config.validate().is_ok() {
            assert!(config.redis.db < listbuffer_core::config::MAX_REDIS_DB);
            assert!(config.redis_chunk > 0 && config.data_chunk > 0);
            assert!(!config.tick_duration().is_zero());
        }
    }
});
