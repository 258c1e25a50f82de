use anyhow::Result;
use flare_echo::{EchoAddrs, Greeting, processors};

/// etcd 端点环境变量（逗号分隔）
const ETCD_ENV: &str = "FLARE_ETCD_ENDPOINTS";
/// 注册根路径环境变量
const BASE_ENV: &str = "FLARE_BASE_LOC";

fn etcd_endpoints() -> Vec<String> {
    std::env::var(ETCD_ENV)
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_loc = std::env::var(BASE_ENV)
        .unwrap_or_else(|_| flare_bootstrap::config::DEFAULT_BASE_LOC.to_string());

    let greeting = Greeting::default();
    let procs = processors(&EchoAddrs::default(), &greeting);

    // 启动参数：-serv <服务位置> -skey <会话 key> [-group] [-logdir] [-logmaxsize] [-logmaxbackups]
    flare_bootstrap::serve(
        etcd_endpoints(),
        &base_loc,
        move |sb| async move { greeting.load(sb).await },
        procs,
    )
    .await?;

    Ok(())
}
