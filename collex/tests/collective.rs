mod collective {
    pub mod helpers;

    mod all_gather;
    mod all_reduce;
    mod all_to_all;
    mod broadcast;
    mod reduce;
    mod reduce_scatter;
    mod scatter_gather;
    mod scenarios;
    mod send_recv;
}
