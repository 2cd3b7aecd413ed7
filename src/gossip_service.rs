//! Thread wiring for the gossip engine: one UDP socket, five workers, three
//! bounded queues between them.

use {
    crate::{cluster_info::ClusterInfo, protocol::Protocol},
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender},
    solana_packet::{Packet, PACKET_DATA_SIZE},
    std::{
        io::ErrorKind,
        net::{SocketAddr, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

pub const GOSSIP_CHANNEL_CAPACITY: usize = 10_000;
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct GossipService {
    thread_hdls: Vec<JoinHandle<()>>,
}

impl GossipService {
    pub fn new(
        cluster_info: &Arc<ClusterInfo>,
        gossip_socket: UdpSocket,
        exit: Arc<AtomicBool>,
    ) -> Self {
        let gossip_socket = Arc::new(gossip_socket);
        trace!(
            "GossipService: id: {}, listening on: {:?}",
            cluster_info.id(),
            gossip_socket.local_addr(),
        );
        let (request_sender, request_receiver) = bounded::<Packet>(GOSSIP_CHANNEL_CAPACITY);
        let (verified_sender, verified_receiver) =
            bounded::<(SocketAddr, Protocol)>(GOSSIP_CHANNEL_CAPACITY);
        let (response_sender, response_receiver) = bounded::<Packet>(GOSSIP_CHANNEL_CAPACITY);
        let t_receiver = spawn_worker("gossipRcvr", &exit, {
            let socket = gossip_socket.clone();
            let exit = exit.clone();
            move || run_receiver(&socket, &request_sender, &exit)
        });
        let t_socket_consume = spawn_worker("gossipCons", &exit, {
            let cluster_info = cluster_info.clone();
            let exit = exit.clone();
            move || cluster_info.run_socket_consume(&request_receiver, &verified_sender, &exit)
        });
        let t_listen = spawn_worker("gossipListen", &exit, {
            let cluster_info = cluster_info.clone();
            let response_sender = response_sender.clone();
            let exit = exit.clone();
            move || cluster_info.run_listen(&verified_receiver, &response_sender, &exit)
        });
        let t_gossip = spawn_worker("gossipBuild", &exit, {
            let cluster_info = cluster_info.clone();
            let exit = exit.clone();
            move || cluster_info.run_gossip(&response_sender, &exit)
        });
        let t_responder = spawn_worker("gossipSend", &exit, {
            let socket = gossip_socket;
            let exit = exit.clone();
            move || run_responder(&socket, &response_receiver, &exit)
        });
        let thread_hdls = vec![
            t_receiver,
            t_socket_consume,
            t_listen,
            t_gossip,
            t_responder,
        ];
        Self { thread_hdls }
    }

    pub fn join(self) -> thread::Result<()> {
        for thread_hdl in self.thread_hdls {
            thread_hdl.join()?;
        }
        Ok(())
    }
}

/// Spawns a named worker which flips the shared exit flag when it returns,
/// so the loss of any one worker winds down the whole engine.
fn spawn_worker(
    name: &str,
    exit: &Arc<AtomicBool>,
    run: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    let exit = exit.clone();
    Builder::new()
        .name(name.to_string())
        .spawn(move || {
            run();
            exit.store(true, Ordering::Relaxed);
        })
        .unwrap()
}

/// Reads datagrams into packets until the exit flag is raised. Read timeouts
/// just re-check the flag.
fn run_receiver(socket: &UdpSocket, sender: &Sender<Packet>, exit: &AtomicBool) {
    socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT)).unwrap();
    let mut buf = [0u8; PACKET_DATA_SIZE];
    while !exit.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((size, addr)) => {
                let mut packet = Packet::default();
                packet.meta_mut().size = size;
                packet.meta_mut().set_socket_addr(&addr);
                packet.buffer_mut()[..size].copy_from_slice(&buf[..size]);
                if sender.send(packet).is_err() {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => (),
            Err(err) => debug!("gossip socket read failed: {err}"),
        }
    }
}

fn run_responder(socket: &UdpSocket, receiver: &Receiver<Packet>, exit: &AtomicBool) {
    while !exit.load(Ordering::Relaxed) {
        let packet = match receiver.recv_timeout(SOCKET_READ_TIMEOUT) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        send_packet(socket, &packet);
        for packet in receiver.try_iter() {
            send_packet(socket, &packet);
        }
    }
}

fn send_packet(socket: &UdpSocket, packet: &Packet) {
    let Some(data) = packet.data(..) else {
        return;
    };
    if let Err(err) = socket.send_to(data, packet.meta().socket_addr()) {
        debug!(
            "sending {} bytes to {} failed: {err}",
            packet.meta().size,
            packet.meta().socket_addr(),
        );
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            contact_info::ContactInfo,
            crds_data::{CrdsData, EpochSlots, MAX_EPOCH_SLOTS},
            crds_value::CrdsValue,
            ping_pong::Ping,
        },
        rand::SeedableRng,
        rand_chacha::ChaChaRng,
        solana_keypair::Keypair,
        solana_signer::Signer,
        solana_time_utils::timestamp,
        std::time::Instant,
    };

    fn new_test_node(keypair: &Keypair) -> ContactInfo {
        ContactInfo::new(
            keypair.pubkey(),
            timestamp(),
            0,
            "127.0.0.1:8000".parse().unwrap(),
        )
    }

    #[test]
    fn test_exit_winds_down_all_workers() {
        let keypair = Arc::new(Keypair::new());
        let cluster_info = Arc::new(ClusterInfo::new(new_test_node(&keypair), keypair));
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let exit = Arc::new(AtomicBool::new(false));
        let service = GossipService::new(&cluster_info, socket, exit.clone());
        exit.store(true, Ordering::Relaxed);
        service.join().unwrap();
    }

    #[test]
    fn test_verifier_end_to_end() {
        solana_logger::setup();
        let mut rng = ChaChaRng::from_seed([83u8; 32]);
        let keypair = Arc::new(Keypair::new());
        let cluster_info = Arc::new(ClusterInfo::new(new_test_node(&keypair), keypair.clone()));
        let (request_sender, request_receiver) = bounded::<Packet>(GOSSIP_CHANNEL_CAPACITY);
        let (verified_sender, verified_receiver) =
            bounded::<(SocketAddr, Protocol)>(GOSSIP_CHANNEL_CAPACITY);
        let exit = Arc::new(AtomicBool::new(false));
        let t_consume = {
            let cluster_info = cluster_info.clone();
            let exit = exit.clone();
            let request_receiver = request_receiver.clone();
            thread::spawn(move || {
                cluster_info.run_socket_consume(&request_receiver, &verified_sender, &exit)
            })
        };

        let from_addr: SocketAddr = "127.0.0.1:9800".parse().unwrap();
        let sender_keypair = Keypair::new();
        let value = CrdsValue::new(
            CrdsData::ContactInfo(new_test_node(&sender_keypair)),
            &sender_keypair,
        );
        let good = Protocol::PushMessage(sender_keypair.pubkey(), vec![value]);
        for _ in 0..3 {
            let packet = Packet::from_data(Some(&from_addr), &good).unwrap();
            request_sender.send(packet).unwrap();
        }
        // Structurally invalid: epoch-slots index at the bound.
        let unsanitary = Protocol::PushMessage(
            sender_keypair.pubkey(),
            vec![CrdsValue::new(
                CrdsData::EpochSlots(
                    MAX_EPOCH_SLOTS,
                    EpochSlots::new(sender_keypair.pubkey(), timestamp()),
                ),
                &sender_keypair,
            )],
        );
        request_sender
            .send(Packet::from_data(Some(&from_addr), &unsanitary).unwrap())
            .unwrap();
        // Signed by a different key than the declared origin.
        let forger = Keypair::new();
        let forged = Protocol::PushMessage(
            sender_keypair.pubkey(),
            vec![CrdsValue::new(
                CrdsData::ContactInfo(new_test_node(&sender_keypair)),
                &forger,
            )],
        );
        request_sender
            .send(Packet::from_data(Some(&from_addr), &forged).unwrap())
            .unwrap();
        // Throw in a valid ping for variety.
        let ping = Ping::new_rand(&mut rng, &sender_keypair);
        request_sender
            .send(Packet::from_data(Some(&from_addr), &Protocol::PingMessage(ping)).unwrap())
            .unwrap();

        let mut num_push_messages = 0;
        let mut num_pings = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while num_push_messages + num_pings < 4 && Instant::now() < deadline {
            match verified_receiver.recv_timeout(Duration::from_millis(100)) {
                Ok((addr, Protocol::PushMessage(from, values))) => {
                    assert_eq!(addr, from_addr);
                    assert_eq!(from, sender_keypair.pubkey());
                    assert_eq!(values[0].pubkey(), sender_keypair.pubkey());
                    num_push_messages += 1;
                }
                Ok((_, Protocol::PingMessage(_))) => num_pings += 1,
                Ok((_, message)) => panic!("unexpected verified message: {message:?}"),
                Err(RecvTimeoutError::Timeout) => (),
                Err(err) => panic!("verified channel died: {err}"),
            }
        }
        // Exactly the three well-formed push messages and the ping pass; the
        // unsanitary and forged packets are dropped.
        assert_eq!(num_push_messages, 3);
        assert_eq!(num_pings, 1);
        assert!(verified_receiver
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        assert!(request_receiver.is_empty());

        exit.store(true, Ordering::Relaxed);
        t_consume.join().unwrap();
    }

    #[test]
    fn test_processor_inserts_and_answers_ping() {
        let mut rng = ChaChaRng::from_seed([89u8; 32]);
        let keypair = Arc::new(Keypair::new());
        let cluster_info = Arc::new(ClusterInfo::new(new_test_node(&keypair), keypair.clone()));
        let (verified_sender, verified_receiver) =
            bounded::<(SocketAddr, Protocol)>(GOSSIP_CHANNEL_CAPACITY);
        let (response_sender, response_receiver) = bounded::<Packet>(GOSSIP_CHANNEL_CAPACITY);
        let exit = Arc::new(AtomicBool::new(false));
        let t_listen = {
            let cluster_info = cluster_info.clone();
            let exit = exit.clone();
            thread::spawn(move || {
                cluster_info.run_listen(&verified_receiver, &response_sender, &exit)
            })
        };

        let from_addr: SocketAddr = "127.0.0.1:9900".parse().unwrap();
        let peer = Keypair::new();
        let value = CrdsValue::new(CrdsData::ContactInfo(new_test_node(&peer)), &peer);
        verified_sender
            .send((
                from_addr,
                Protocol::PushMessage(peer.pubkey(), vec![value]),
            ))
            .unwrap();
        let ping = Ping::new_rand(&mut rng, &peer);
        verified_sender
            .send((from_addr, Protocol::PingMessage(ping.clone())))
            .unwrap();

        let packet = response_receiver
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(packet.meta().socket_addr(), from_addr);
        let protocol: Protocol = packet.deserialize_slice(..).unwrap();
        let Protocol::PongMessage(pong) = protocol else {
            panic!("expected the pong response");
        };
        assert_eq!(*pong.from(), cluster_info.id());
        assert!(pong.verify());
        assert!(pong.matches(&ping));
        // The pushed contact info is the table's only record, and the pong is
        // the only packet owed.
        assert!(response_receiver
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        {
            let crds = cluster_info.crds.read().unwrap();
            assert_eq!(crds.get_contact_infos().count(), 1);
            assert_eq!(crds.len(), 1);
        }

        exit.store(true, Ordering::Relaxed);
        t_listen.join().unwrap();
    }
}
