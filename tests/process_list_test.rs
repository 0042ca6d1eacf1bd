use std::collections::HashSet;

use jumptunnel::ssh::nested::{find_free_port, port_from_tunnel_command};
use jumptunnel::ssh::process::{ProcessRow, find_header, parse_listing};

/// `ps aux` output from a jump host with two nested tunnels running.
const PS_AUX: &str = "\
USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND
root           1  0.0  0.1 128164  6820 ?        Ss   Jan01   0:12 /usr/lib/systemd/systemd --switched-root --system
root         812  0.0  0.0 112920  4312 ?        Ss   Jan01   0:00 /usr/sbin/sshd -D
centos     20001  0.0  0.0 185296  5408 ?        S    10:00   0:00 ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no -o GSSAPIAuthentication=no master-0 -N -D 5555
centos     20417  0.0  0.0 185296  5412 ?        S    10:05   0:00 ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no -o GSSAPIAuthentication=no master-0 -N -D 5557
centos     20433  0.0  0.0 151064  1828 pts/0    R+   10:06   0:00 ps aux
this line is not a process row
";

const TUNNEL_PREFIX: &str = "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no \
                             -o GSSAPIAuthentication=no master-0 -N -D ";

fn lines() -> Vec<&'static str> {
    PS_AUX.lines().collect()
}

#[test]
fn test_listing_parses_rows_and_skips_garbage() {
    let rows = parse_listing(&lines()).unwrap();

    assert_eq!(rows.len(), 5);
    assert_eq!(
        rows[1],
        ProcessRow {
            user: "root".into(),
            pid: 812,
            command: "/usr/sbin/sshd -D".into(),
        }
    );
    assert_eq!(rows[4].command, "ps aux");
}

#[test]
fn test_header_after_banner_lines() {
    let mut with_banner = vec!["Last login: Mon Jan  1 10:00:00 2024", ""];
    with_banner.extend(lines());

    let (index, _) = find_header(&with_banner).unwrap();
    assert_eq!(index, 2);
    assert_eq!(parse_listing(&with_banner).unwrap().len(), 5);
}

#[test]
fn test_listing_without_header() {
    assert!(parse_listing(&["root 1 init"]).is_none());
    assert!(parse_listing::<&str>(&[]).is_none());
}

#[test]
fn test_busy_ports_from_listing() {
    let rows = parse_listing(&lines()).unwrap();
    let busy: HashSet<u16> = rows
        .iter()
        .filter(|row| row.command.contains(TUNNEL_PREFIX))
        .map(|row| port_from_tunnel_command(&row.command).unwrap())
        .collect();

    assert_eq!(busy, HashSet::from([5555, 5557]));
    assert_eq!(find_free_port(&busy, 5555, 100), Some(5556));
}
